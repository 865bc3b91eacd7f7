pub mod errors;

use std::sync::LazyLock;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

/// Output format used when a size neither overrides nor keeps the request format.
pub const DEFAULT_FALLBACK_FORMAT: &str = "jpeg";

/// Format assumed for a watermark whose URL carries no extension.
pub const DEFAULT_WATERMARK_FORMAT: &str = "jpeg";

pub const DEFAULT_WATERMARK_QUALITY: u8 = 100;

pub const DEFAULT_WATERMARK_DISSOLVE: u8 = 100;

pub const DEFAULT_WATERMARK_TTL: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Formats the transform executors can encode to.
pub const ENCODABLE_FORMATS: &[&str] = &[
    "jpeg", "jpg", "png", "webp", "gif", "tiff", "tif", "bmp", "avif",
];

pub fn is_encodable(format: &str) -> bool {
    ENCODABLE_FORMATS
        .iter()
        .any(|f| f.eq_ignore_ascii_case(format))
}

/// MIME type for an output format, used when writing to the blob store.
pub fn content_type_for(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "tiff" | "tif" => "image/tiff",
        "bmp" => "image/bmp",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}

pub static CURRENT_NUM_THREADS: LazyLock<usize> = LazyLock::new(|| {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
});

// Shared Tokio runtime: Rocket, the watermark janitor and the worker pool
// (through its handle) all run on it.
pub static RESIZER_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Builder::new_multi_thread()
        .worker_threads(*CURRENT_NUM_THREADS)
        .thread_name("resizer-io-worker")
        .enable_all()
        .build()
        .expect("Failed to build resizer Tokio runtime")
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodable_formats_ignore_case() {
        assert!(is_encodable("PNG"));
        assert!(is_encodable("jpg"));
        assert!(!is_encodable("psd"));
        assert!(!is_encodable(""));
    }

    #[test]
    fn content_type_matches_format() {
        assert_eq!(content_type_for("jpeg"), "image/jpeg");
        assert_eq!(content_type_for("JPG"), "image/jpeg");
        assert_eq!(content_type_for("webp"), "image/webp");
        assert_eq!(content_type_for("heic"), "application/octet-stream");
    }
}
