pub mod aws;
pub mod executor;
pub mod fetch;
pub mod local;
pub mod magick;
pub mod native;
pub mod store;
