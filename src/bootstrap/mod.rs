pub mod config;
pub mod setup;
