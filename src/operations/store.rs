use std::path::Path;

use async_trait::async_trait;

/// Bucket and region a request reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobLocation {
    pub bucket: String,
    pub region: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
        }
    }
}

/// Remote object storage addressed by (bucket, region, key).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Download `key` into the local file `dest`.
    async fn get(&self, location: &BlobLocation, key: &str, dest: &Path) -> anyhow::Result<()>;

    /// Upload the local file `src` to `key`.
    async fn put(
        &self,
        location: &BlobLocation,
        key: &str,
        src: &Path,
        content_type: &str,
    ) -> anyhow::Result<()>;

    async fn delete(&self, location: &BlobLocation, key: &str) -> anyhow::Result<()>;
}
