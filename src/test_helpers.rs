//! Recording fakes for the pipeline's collaborators.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;

use crate::background::pipeline::PipelineContext;
use crate::background::watermark::WatermarkCache;
use crate::metrics::CounterMetrics;
use crate::models::request::{ResizeOptions, Size};
use crate::operations::executor::{
    Dimensions, ExecError, Gravity, Quality, ResizeMode, TransformExecutor,
};
use crate::operations::fetch::WatermarkFetcher;
use crate::operations::store::{BlobLocation, BlobStore};

pub const SOURCE_DIMENSIONS: (u32, u32) = (4000, 3000);

pub fn size(name: &str, x: u32, y: u32) -> Size {
    Size {
        size_name: name.to_string(),
        resize_options: Some(ResizeOptions {
            x,
            y,
            quick_resize: false,
            image_quality: 85,
        }),
        ..Size::default()
    }
}

/// Body with a "large" size and a cropped "thumb" size.
pub fn request_json() -> String {
    serde_json::json!({
        "original_path": "uploads/original.jpg",
        "path_to_save": "out/123",
        "format": "png",
        "bucket_name": "media",
        "region": "eu-west-1",
        "sizes": [
            {
                "size_name": "thumb",
                "resize_options": { "x": 300, "y": 200 },
                "crop_options": { "width": 200, "height": 150, "x": 50, "y": 50 }
            },
            {
                "size_name": "large",
                "resize_options": { "x": 1600, "y": 1200, "image_quality": 85 }
            }
        ]
    })
    .to_string()
}

// ────────────────────────────────────────────────────────────────
// Executor
// ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOp {
    Resize {
        src: PathBuf,
        dst: PathBuf,
        width: u32,
        height: u32,
        quality: u8,
        mode: ResizeMode,
    },
    Crop {
        src: PathBuf,
        dst: PathBuf,
        width: u32,
        height: u32,
        x: i32,
        y: i32,
    },
    Composite {
        overlay: PathBuf,
        base: PathBuf,
        dst: PathBuf,
        x: i32,
        y: i32,
        dissolve: u8,
    },
    Normalize {
        src: PathBuf,
        dst: PathBuf,
        hint: Option<(u32, u32)>,
    },
    Inspect {
        path: PathBuf,
    },
}

impl ExecOp {
    fn name(&self) -> &'static str {
        match self {
            ExecOp::Resize { .. } => "resize",
            ExecOp::Crop { .. } => "crop",
            ExecOp::Composite { .. } => "composite",
            ExecOp::Normalize { .. } => "normalize",
            ExecOp::Inspect { .. } => "inspect",
        }
    }
}

/// Writes a placeholder file for every output and tracks the dimensions an
/// ImageMagick run would have produced.
#[derive(Default)]
pub struct RecordingExecutor {
    ops: Mutex<Vec<ExecOp>>,
    created: Mutex<Vec<PathBuf>>,
    dims: Mutex<HashMap<PathBuf, (u32, u32)>>,
    fail_on: Option<(&'static str, usize)>,
    time_out: bool,
}

impl RecordingExecutor {
    /// Fail the `nth` call (zero-based) of operation `op`.
    pub fn failing(op: &'static str, nth: usize) -> Self {
        Self {
            fail_on: Some((op, nth)),
            ..Self::default()
        }
    }

    /// Like [`RecordingExecutor::failing`], but the call reports a timeout.
    pub fn timing_out(op: &'static str, nth: usize) -> Self {
        Self {
            fail_on: Some((op, nth)),
            time_out: true,
            ..Self::default()
        }
    }

    pub fn ops(&self) -> Vec<ExecOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<PathBuf> {
        self.created.lock().unwrap().clone()
    }

    fn record(&self, op: ExecOp) -> Result<(), ExecError> {
        let mut ops = self.ops.lock().unwrap();
        let name = op.name();
        let seen = ops.iter().filter(|o| o.name() == name).count();
        ops.push(op);
        if self.fail_on == Some((name, seen)) && self.time_out {
            return Err(ExecError::Timeout {
                program: name.to_string(),
                timeout: Duration::from_secs(30),
            });
        }
        if self.fail_on == Some((name, seen)) {
            return Err(ExecError::Failed {
                program: name.to_string(),
                status: "exit status: 1".to_string(),
                output: format!("{name} refused"),
            });
        }
        Ok(())
    }

    fn dims_of(&self, path: &Path) -> Option<(u32, u32)> {
        self.dims.lock().unwrap().get(path).copied()
    }

    fn write(&self, dst: &Path, dims: (u32, u32)) -> Result<(), ExecError> {
        std::fs::write(dst, b"image").map_err(|source| ExecError::Image {
            path: dst.to_path_buf(),
            source: source.into(),
        })?;
        self.created.lock().unwrap().push(dst.to_path_buf());
        self.dims.lock().unwrap().insert(dst.to_path_buf(), dims);
        Ok(())
    }
}

/// `-resize WxH` semantics: fit inside the box, keeping the aspect ratio.
pub fn fit_within(src: (u32, u32), width: u32, height: u32) -> (u32, u32) {
    let ratio = (f64::from(width) / f64::from(src.0)).min(f64::from(height) / f64::from(src.1));
    (
        ((f64::from(src.0) * ratio).round() as u32).max(1),
        ((f64::from(src.1) * ratio).round() as u32).max(1),
    )
}

#[async_trait]
impl TransformExecutor for RecordingExecutor {
    async fn resize(
        &self,
        src: &Path,
        dst: &Path,
        width: u32,
        height: u32,
        quality: Quality,
        mode: ResizeMode,
    ) -> Result<(), ExecError> {
        self.record(ExecOp::Resize {
            src: src.into(),
            dst: dst.into(),
            width,
            height,
            quality: quality.value(),
            mode,
        })?;
        let dims = match self.dims_of(src) {
            Some(source) => fit_within(source, width, height),
            None => (width, height),
        };
        self.write(dst, dims)
    }

    async fn crop(
        &self,
        src: &Path,
        dst: &Path,
        width: u32,
        height: u32,
        x: i32,
        y: i32,
    ) -> Result<(), ExecError> {
        self.record(ExecOp::Crop {
            src: src.into(),
            dst: dst.into(),
            width,
            height,
            x,
            y,
        })?;
        let (sw, sh) = self.dims_of(src).unwrap_or((width, height));
        let dims = (
            width.min(sw.saturating_sub(x.max(0) as u32)),
            height.min(sh.saturating_sub(y.max(0) as u32)),
        );
        self.write(dst, dims)
    }

    async fn composite(
        &self,
        overlay: &Path,
        base: &Path,
        dst: &Path,
        x: i32,
        y: i32,
        dissolve: u8,
        _gravity: Gravity,
    ) -> Result<(), ExecError> {
        self.record(ExecOp::Composite {
            overlay: overlay.into(),
            base: base.into(),
            dst: dst.into(),
            x,
            y,
            dissolve,
        })?;
        let dims = self.dims_of(base).unwrap_or((1, 1));
        self.write(dst, dims)
    }

    async fn normalize(
        &self,
        src: &Path,
        dst: &Path,
        hint: Option<(u32, u32)>,
    ) -> Result<(), ExecError> {
        self.record(ExecOp::Normalize {
            src: src.into(),
            dst: dst.into(),
            hint,
        })?;
        self.write(dst, SOURCE_DIMENSIONS)
    }

    async fn inspect(&self, path: &Path) -> Result<Dimensions, ExecError> {
        self.record(ExecOp::Inspect { path: path.into() })?;
        let (width, height) = self.dims_of(path).ok_or_else(|| ExecError::Parse {
            program: "inspect".to_string(),
            output: format!("no such artifact {:?}", path),
        })?;
        Ok(Dimensions { width, height })
    }
}

// ────────────────────────────────────────────────────────────────
// Store
// ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    gets: Mutex<Vec<String>>,
    puts: Mutex<Vec<(String, String)>>,
    deletes: Mutex<Vec<String>>,
    fail_puts: HashSet<String>,
    fail_get: bool,
}

impl MemoryStore {
    pub fn failing_puts(keys: &[&str]) -> Self {
        Self {
            fail_puts: keys.iter().map(|k| k.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn failing_get() -> Self {
        Self {
            fail_get: true,
            ..Self::default()
        }
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    /// Every attempted put as (key, content type).
    pub fn puts(&self) -> Vec<(String, String)> {
        self.puts.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get(&self, _location: &BlobLocation, key: &str, dest: &Path) -> Result<()> {
        self.gets.lock().unwrap().push(key.to_string());
        if self.fail_get {
            bail!("no such key: {key}");
        }
        std::fs::write(dest, b"source")?;
        Ok(())
    }

    async fn put(
        &self,
        _location: &BlobLocation,
        key: &str,
        src: &Path,
        content_type: &str,
    ) -> Result<()> {
        self.puts
            .lock()
            .unwrap()
            .push((key.to_string(), content_type.to_string()));
        if self.fail_puts.contains(key) {
            bail!("access denied for {key}");
        }
        let bytes = std::fs::read(src)?;
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, _location: &BlobLocation, key: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────
// Fetcher
// ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CountingFetcher {
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    fail_for: Option<String>,
}

impl CountingFetcher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing_for(url: &str) -> Self {
        Self {
            fail_for: Some(url.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl WatermarkFetcher for CountingFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_for.as_deref() == Some(url) {
            // Leave a partial file behind, as an interrupted download would.
            std::fs::write(dest, b"part")?;
            bail!("404 Not Found for {url}");
        }
        std::fs::write(dest, b"watermark")?;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────

/// A pipeline context over recording fakes and scratch directories.
pub struct Harness {
    pub executor: Arc<RecordingExecutor>,
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<CountingFetcher>,
    pub metrics: Arc<CounterMetrics>,
    pub watermarks: Arc<WatermarkCache>,
    work_dir: TempDir,
    _watermark_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_executor(RecordingExecutor::default())
    }

    pub fn with_executor(executor: RecordingExecutor) -> Self {
        Self::build(executor, MemoryStore::default(), CountingFetcher::default())
    }

    pub fn with_executor_failure(op: &'static str, nth: usize) -> Self {
        Self::with_executor(RecordingExecutor::failing(op, nth))
    }

    pub fn with_failing_puts(keys: &[&str]) -> Self {
        Self::build(
            RecordingExecutor::default(),
            MemoryStore::failing_puts(keys),
            CountingFetcher::default(),
        )
    }

    pub fn with_failing_get() -> Self {
        Self::build(
            RecordingExecutor::default(),
            MemoryStore::failing_get(),
            CountingFetcher::default(),
        )
    }

    pub fn with_fetcher(fetcher: CountingFetcher) -> Self {
        Self::build(RecordingExecutor::default(), MemoryStore::default(), fetcher)
    }

    fn build(executor: RecordingExecutor, store: MemoryStore, fetcher: CountingFetcher) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let watermark_dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(fetcher);
        let watermarks = Arc::new(WatermarkCache::new(
            watermark_dir.path(),
            Duration::from_secs(3600),
            fetcher.clone(),
        ));
        Self {
            executor: Arc::new(executor),
            store: Arc::new(store),
            fetcher,
            metrics: Arc::new(CounterMetrics::default()),
            watermarks,
            work_dir,
            _watermark_dir: watermark_dir,
        }
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn context(&self) -> PipelineContext {
        PipelineContext {
            executor: self.executor.clone(),
            store: self.store.clone(),
            watermarks: self.watermarks.clone(),
            metrics: self.metrics.clone(),
            work_dir: self.work_dir.path().to_path_buf(),
        }
    }
}
