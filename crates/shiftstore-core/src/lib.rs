//! Shiftstore Core Library
//!
//! This crate provides the configuration and shared storage types used by the
//! storage and CLI crates.

pub mod config;
pub mod constants;
pub mod storage_types;

// Re-export commonly used types
pub use config::Config;
pub use constants::UploadPrefix;
pub use storage_types::BucketKind;
