//! Bucket abstraction trait
//!
//! This module defines the Bucket trait that every storage backend implements,
//! together with the error type and the record/stream types it hands out.

use crate::BucketKind;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Bucket operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to open bucket: {0}")]
    Open(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Read failed for {key}: {message}")]
    ReadFailed { key: String, message: String },

    #[error("Write failed for {key}: {message}")]
    WriteFailed { key: String, message: String },

    #[error("List failed for prefix {prefix:?}: {message}")]
    ListFailed { prefix: String, message: String },

    #[error("Existence check failed for {key}: {message}")]
    ExistsFailed { key: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Bucket is closed")]
    Closed,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }
}

/// Result type for bucket operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata for one object, as produced by listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Content of a single object. Dropping the stream releases the underlying
/// file handle or connection.
pub type ObjectStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Lazy enumeration of object records. `None` marks the end of the listing.
pub type ObjectListing = BoxStream<'static, StorageResult<ObjectRecord>>;

/// Bucket abstraction trait
///
/// Both backends (local filesystem, cloud object store) implement this trait so
/// that the migration engine can copy between any pair of them.
///
/// Every I/O operation takes the caller's cancellation token. When it fires,
/// in-flight work stops and the operation returns [`StorageError::Cancelled`].
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Which backend this handle talks to
    fn kind(&self) -> BucketKind;

    /// Root path or bucket URL, for logs
    fn location(&self) -> &str;

    /// Open the content of `key` as a stream
    ///
    /// Returns `NotFound` if the key is absent.
    async fn read(&self, ctx: &CancellationToken, key: &str) -> StorageResult<ObjectStream>;

    /// Store `content` under `key`, replacing any existing object
    ///
    /// The object becomes visible only once the whole stream has been
    /// written; a failed or cancelled write leaves the previous state in place.
    /// Returns the number of bytes written.
    async fn write(
        &self,
        ctx: &CancellationToken,
        key: &str,
        content: ObjectStream,
    ) -> StorageResult<u64>;

    /// Enumerate every object whose key starts with `prefix`
    ///
    /// Each call starts a fresh enumeration. Records are produced lazily.
    fn list(&self, prefix: &str) -> ObjectListing;

    /// Check whether `key` exists. Absence is `Ok(false)`, not an error.
    async fn exists(&self, ctx: &CancellationToken, key: &str) -> StorageResult<bool>;

    /// Release backend resources. Calling it again is a no-op.
    async fn close(&self) -> StorageResult<()>;
}

/// Run `fut` unless `ctx` is cancelled first.
pub async fn with_cancellation<F>(ctx: &CancellationToken, fut: F) -> StorageResult<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(StorageError::Cancelled),
        output = fut => Ok(output),
    }
}

/// A listing that yields a single error and ends.
pub(crate) fn failed_listing(error: StorageError) -> ObjectListing {
    Box::pin(futures::stream::once(async move { Err(error) }))
}
