use std::fmt;
use thiserror::Error;

/// A step of the per-size transform chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Resize,
    Crop,
    Watermark,
    Inspect,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Resize => "resize",
            Step::Crop => "crop",
            Step::Watermark => "watermark",
            Step::Inspect => "inspect",
        };
        f.write_str(name)
    }
}

/// One size whose upload did not go through.
#[derive(Debug)]
pub struct UploadFailure {
    pub size: String,
    pub key: String,
    pub error: anyhow::Error,
}

/// Everything a resize request can fail with.
#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("{0}")]
    BadRequest(String),
    #[error("failed to fetch source image")]
    SourceFetch(#[source] anyhow::Error),
    #[error("failed to normalize source image")]
    Normalize(#[source] anyhow::Error),
    #[error("size `{size}`: {step} step failed")]
    SizeStep {
        size: String,
        step: Step,
        #[source]
        source: anyhow::Error,
    },
    #[error(
        "upload failed for {count} of {total} sizes: {detail}",
        count = .failures.len(),
        detail = describe_failures(.failures)
    )]
    Upload {
        failures: Vec<UploadFailure>,
        total: usize,
    },
    #[error("failed to fetch watermark {url}")]
    CacheFetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResizeError {
    pub fn size_step(size: impl Into<String>, step: Step, source: impl Into<anyhow::Error>) -> Self {
        ResizeError::SizeStep {
            size: size.into(),
            step,
            source: source.into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, ResizeError::BadRequest(_))
    }
}

fn describe_failures(failures: &[UploadFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({}: {:#})", f.size, f.key, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Flatten an error and its causes into one line for logs.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
