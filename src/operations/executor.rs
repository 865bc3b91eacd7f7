use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Width and height of an image on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Filtered resampling or a cheap pixel scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    Filtered,
    Fast,
}

impl ResizeMode {
    pub fn from_quick(quick: bool) -> Self {
        if quick { ResizeMode::Fast } else { ResizeMode::Filtered }
    }
}

/// Anchor for composite offsets. Only north-west is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gravity {
    NorthWest,
}

impl Gravity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gravity::NorthWest => "northwest",
        }
    }
}

/// Encoder quality, clamped to 1..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(u8);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

/// Per-call limits applied by every executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            memory_mb: 512,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with {status}: {output}")]
    Failed {
        program: String,
        status: String,
        output: String,
    },
    #[error("`{program}` timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("unexpected output from `{program}`: {output:?}")]
    Parse { program: String, output: String },
    #[error("image operation failed on {path}")]
    Image {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// The image operations a pipeline run is built from.
#[async_trait]
pub trait TransformExecutor: Send + Sync {
    async fn resize(
        &self,
        src: &Path,
        dst: &Path,
        width: u32,
        height: u32,
        quality: Quality,
        mode: ResizeMode,
    ) -> Result<(), ExecError>;

    async fn crop(
        &self,
        src: &Path,
        dst: &Path,
        width: u32,
        height: u32,
        x: i32,
        y: i32,
    ) -> Result<(), ExecError>;

    #[allow(clippy::too_many_arguments)]
    async fn composite(
        &self,
        overlay: &Path,
        base: &Path,
        dst: &Path,
        x: i32,
        y: i32,
        dissolve: u8,
        gravity: Gravity,
    ) -> Result<(), ExecError>;

    /// Apply EXIF orientation and strip metadata. `hint` lets the decoder
    /// shrink the image while reading it.
    async fn normalize(
        &self,
        src: &Path,
        dst: &Path,
        hint: Option<(u32, u32)>,
    ) -> Result<(), ExecError>;

    async fn inspect(&self, path: &Path) -> Result<Dimensions, ExecError>;
}
