use std::ffi::OsString;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::store::{BlobLocation, BlobStore};

pub const AWS: &str = "aws";

/// S3 through the `aws` command line tool. Credentials come from its own
/// configuration chain.
#[derive(Debug, Clone)]
pub struct AwsCliStore {
    timeout: Duration,
}

impl AwsCliStore {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, args: Vec<OsString>) -> Result<()> {
        let start_time = Instant::now();
        let mut cmd = Command::new(AWS);
        cmd.args(&args).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("`aws` timed out after {:?}", self.timeout))?
            .context("Fail to spawn `aws`")?;
        if !output.status.success() {
            bail!(
                "aws {:?} failed with {}: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(duration = &*format!("{:?}", start_time.elapsed()); "aws {:?}", args);
        Ok(())
    }
}

pub fn s3_uri(location: &BlobLocation, key: &str) -> String {
    format!("s3://{}/{}", location.bucket, key.trim_start_matches('/'))
}

pub fn get_args(location: &BlobLocation, key: &str, dest: &Path) -> Vec<OsString> {
    vec![
        "s3".into(),
        "cp".into(),
        s3_uri(location, key).into(),
        dest.as_os_str().to_os_string(),
        "--region".into(),
        location.region.clone().into(),
    ]
}

pub fn put_args(location: &BlobLocation, key: &str, src: &Path, content_type: &str) -> Vec<OsString> {
    vec![
        "s3".into(),
        "cp".into(),
        src.as_os_str().to_os_string(),
        s3_uri(location, key).into(),
        "--region".into(),
        location.region.clone().into(),
        "--content-type".into(),
        content_type.into(),
    ]
}

pub fn delete_args(location: &BlobLocation, key: &str) -> Vec<OsString> {
    vec![
        "s3".into(),
        "rm".into(),
        s3_uri(location, key).into(),
        "--region".into(),
        location.region.clone().into(),
    ]
}

#[async_trait]
impl BlobStore for AwsCliStore {
    async fn get(&self, location: &BlobLocation, key: &str, dest: &Path) -> Result<()> {
        self.run(get_args(location, key, dest))
            .await
            .with_context(|| format!("failed to download {}", s3_uri(location, key)))
    }

    async fn put(
        &self,
        location: &BlobLocation,
        key: &str,
        src: &Path,
        content_type: &str,
    ) -> Result<()> {
        self.run(put_args(location, key, src, content_type))
            .await
            .with_context(|| format!("failed to upload {}", s3_uri(location, key)))
    }

    async fn delete(&self, location: &BlobLocation, key: &str) -> Result<()> {
        self.run(delete_args(location, key))
            .await
            .with_context(|| format!("failed to delete {}", s3_uri(location, key)))
    }
}
