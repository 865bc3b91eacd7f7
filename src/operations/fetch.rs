use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Downloads a remote file to a local path.
#[async_trait]
pub trait WatermarkFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build watermark HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WatermarkFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("unexpected status from {url}"))?;

        let mut file = File::create(dest)
            .await
            .with_context(|| format!("failed to create {:?}", dest))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("failed to read body of {url}"))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write {:?}", dest))?;
        }
        file.flush()
            .await
            .with_context(|| format!("failed to flush {:?}", dest))?;
        Ok(())
    }
}
