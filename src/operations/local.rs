use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::fs;

use super::store::{BlobLocation, BlobStore};

/// Blob store on the local filesystem: `<root>/<bucket>/<key>`. The region
/// is ignored.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &BlobLocation, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob key: {:?}", key);
        }
        if location.bucket.is_empty() || location.bucket.contains(['/', '\\']) {
            bail!("invalid bucket name: {:?}", location.bucket);
        }
        Ok(self.root.join(&location.bucket).join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn get(&self, location: &BlobLocation, key: &str, dest: &Path) -> Result<()> {
        let path = self.resolve(location, key)?;
        fs::copy(&path, dest)
            .await
            .with_context(|| format!("failed to copy {:?} to {:?}", path, dest))?;
        Ok(())
    }

    async fn put(
        &self,
        location: &BlobLocation,
        key: &str,
        src: &Path,
        _content_type: &str,
    ) -> Result<()> {
        let path = self.resolve(location, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        fs::copy(src, &path)
            .await
            .with_context(|| format!("failed to copy {:?} to {:?}", src, path))?;
        Ok(())
    }

    async fn delete(&self, location: &BlobLocation, key: &str) -> Result<()> {
        let path = self.resolve(location, key)?;
        fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to delete {:?}", path))
    }
}
