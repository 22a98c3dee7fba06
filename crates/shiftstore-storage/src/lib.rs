//! Shiftstore Storage Library
//!
//! This crate provides the bucket abstraction and its backends, plus the engine
//! that migrates objects from one bucket to another.
//!
//! # Buckets
//!
//! A bucket is opened from a locator string with [`open_bucket`]:
//!
//! - a filesystem path (or `file://` URL) opens a [`LocalBucket`]
//! - `s3://bucket[/root]` or `mem://name[/root]` opens a [`CloudBucket`]
//! - the empty string opens the configured default bucket
//!
//! Keys are slash-delimited relative paths. They must not be empty, start with
//! `/`, or contain `.`/`..`/empty segments. See the `keys` module.
//!
//! # Migration
//!
//! [`Migration`] copies every object under a prefix that the destination does
//! not already have. [`migrate_prefixes`] runs it over the configured upload
//! directories.

#[cfg(feature = "storage-cloud")]
pub mod cloud;
pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod locator;
pub mod migration;
pub mod traits;

// Re-export commonly used types
#[cfg(feature = "storage-cloud")]
pub use cloud::CloudBucket;
pub use factory::open_bucket;
#[cfg(feature = "storage-local")]
pub use local::LocalBucket;
pub use locator::Locator;
pub use migration::{
    migrate_prefixes, Migration, MigrationError, MigrationReport, MigrationState, MigrationStep,
    PrefixMigrationError,
};
pub use shiftstore_core::BucketKind;
pub use traits::{
    with_cancellation, Bucket, ObjectListing, ObjectRecord, ObjectStream, StorageError,
    StorageResult,
};
pub use tokio_util::sync::CancellationToken;
