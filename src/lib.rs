//! HTTP image-resize service.
//!
//! A request names a source blob and a list of output sizes. A fixed pool of
//! workers admits runs; each run downloads the source, normalizes it, derives
//! every size from the previous one (largest first), optionally crops and
//! watermarks, and uploads all sizes concurrently. Watermark downloads are
//! shared through a TTL cache.

#[macro_use]
extern crate rocket;

pub mod api;
pub mod background;
pub mod bootstrap;
pub mod common;
pub mod metrics;
pub mod models;
pub mod operations;

#[cfg(test)]
mod test_helpers;
