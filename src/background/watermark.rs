use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use reqwest::Url;
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common::DEFAULT_WATERMARK_FORMAT;
use crate::common::errors::ResizeError;
use crate::operations::fetch::WatermarkFetcher;

/// A cached watermark file on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub path: PathBuf,
    pub format: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    watermark: Watermark,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Watermark downloads shared across runs. Entries live for a fixed TTL
/// from the moment they were stored; the backing file exists exactly as
/// long as the entry.
pub struct WatermarkCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    dir: PathBuf,
    fetcher: Arc<dyn WatermarkFetcher>,
    janitor: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl WatermarkCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, fetcher: Arc<dyn WatermarkFetcher>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            dir: dir.into(),
            fetcher,
            janitor: Mutex::new(None),
        }
    }

    /// Return the cached watermark for `url`, downloading it when there is
    /// no live entry.
    pub async fn get_or_fetch(&self, url: &str) -> Result<Watermark, ResizeError> {
        if let Some(entry) = self.entries.read().await.get(url)
            && entry.is_live(Instant::now())
        {
            return Ok(entry.watermark.clone());
        }

        let format = format_from_url(url);
        let path = self.dir.join(format!("{}.{}", Uuid::new_v4(), format));
        if let Err(source) = self.fetcher.fetch(url, &path).await {
            remove_quietly(&path).await;
            return Err(ResizeError::CacheFetch {
                url: url.to_string(),
                source,
            });
        }
        debug!("Downloaded watermark {} to {:?}", url, path);

        let fresh = CacheEntry {
            watermark: Watermark { path, format },
            expires_at: Instant::now() + self.ttl,
        };
        let (winner, discarded) = {
            let mut entries = self.entries.write().await;
            match entries.get(url) {
                // A concurrent fetch stored a live entry first.
                Some(existing) if existing.is_live(Instant::now()) => {
                    (existing.watermark.clone(), Some(fresh.watermark.path))
                }
                _ => {
                    let winner = fresh.watermark.clone();
                    let replaced = entries.insert(url.to_string(), fresh);
                    (winner, replaced.map(|old| old.watermark.path))
                }
            }
        };
        if let Some(path) = discarded {
            remove_quietly(&path).await;
        }
        Ok(winner)
    }

    /// Remove expired entries and their files. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut entries = self.entries.write().await;
            entries.retain(|_, entry| {
                if entry.is_live(now) {
                    true
                } else {
                    expired.push(entry.watermark.path.clone());
                    false
                }
            });
        }
        for path in &expired {
            remove_quietly(path).await;
        }
        if !expired.is_empty() {
            debug!("Evicted {} expired watermarks", expired.len());
        }
        expired.len()
    }

    /// Spawn the janitor that sweeps expired entries every `interval`.
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let Ok(mut janitor) = self.janitor.lock() else {
            error!("Watermark janitor state poisoned, not starting");
            return;
        };
        if janitor.is_some() {
            warn!("Watermark janitor already running");
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        cache.sweep_expired().await;
                    }
                }
            }
        });
        *janitor = Some((stop_tx, handle));
        info!("Watermark janitor started, sweeping every {:?}", interval);
    }

    /// Stop the janitor and remove every entry regardless of its deadline.
    pub async fn shutdown(&self) {
        let janitor = match self.janitor.lock() {
            Ok(mut janitor) => janitor.take(),
            Err(_) => None,
        };
        if let Some((stop_tx, handle)) = janitor {
            let _ = stop_tx.send(());
            if let Err(err) = handle.await {
                error!("Watermark janitor ended abnormally: {}", err);
            }
        }

        let drained: Vec<PathBuf> = {
            let mut entries = self.entries.write().await;
            entries
                .drain()
                .map(|(_, entry)| entry.watermark.path)
                .collect()
        };
        for path in &drained {
            remove_quietly(path).await;
        }
        info!("Watermark cache cleared ({} files)", drained.len());
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Lower-cased extension of the URL path, or the default watermark format.
pub fn format_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            Path::new(parsed.path())
                .extension()
                .and_then(|ext| ext.to_str())
                .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .map(|ext| ext.to_ascii_lowercase())
        })
        .unwrap_or_else(|| DEFAULT_WATERMARK_FORMAT.to_string())
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => error!("Failed to remove watermark file {:?}: {}", path, err),
    }
}
