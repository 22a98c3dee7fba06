//! Cross-bucket migration
//!
//! A [`Migration`] copies every object under a prefix from a source bucket to a
//! destination bucket. Objects already present in the destination are skipped,
//! so a run interrupted halfway can simply be started again.
//!
//! The skip decision only looks at the key. A destination object with the same
//! key but different content is left untouched; contents are never compared.

use crate::traits::{with_cancellation, Bucket, ObjectRecord, StorageError};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use shiftstore_core::UploadPrefix;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Which per-object operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStep {
    Exists,
    Read,
    Write,
}

impl Display for MigrationStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            MigrationStep::Exists => write!(f, "check existence of"),
            MigrationStep::Read => write!(f, "read"),
            MigrationStep::Write => write!(f, "write"),
        }
    }
}

/// Migration errors. Every variant names what was being done when it failed.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to list source under prefix {prefix:?}: {source}")]
    List {
        prefix: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to {step} {key}: {source}")]
    Object {
        step: MigrationStep,
        key: String,
        #[source]
        source: StorageError,
    },
}

impl MigrationError {
    /// The underlying bucket error
    pub fn storage_error(&self) -> &StorageError {
        match self {
            MigrationError::List { source, .. } | MigrationError::Object { source, .. } => source,
        }
    }

    /// Whether the run stopped because the caller cancelled it
    pub fn is_cancelled(&self) -> bool {
        self.storage_error().is_cancelled()
    }
}

/// Lifecycle of a migration job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Unstarted,
    Running,
    Completed,
    Failed,
}

/// Outcome of a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub prefix: String,
    /// Objects written to the destination
    pub copied: u64,
    /// Objects already present in the destination
    pub skipped: u64,
    /// Bytes written to the destination
    pub bytes: u64,
}

#[derive(Default)]
struct Tally {
    copied: AtomicU64,
    skipped: AtomicU64,
    bytes: AtomicU64,
}

/// A migration job between two borrowed buckets
///
/// The job never closes either bucket; the caller that opened them does.
pub struct Migration<'a> {
    source: &'a dyn Bucket,
    destination: &'a dyn Bucket,
    prefix: String,
    concurrency: usize,
    state: MigrationState,
}

impl<'a> Migration<'a> {
    /// Create a job copying the whole source namespace, one key at a time
    pub fn new(source: &'a dyn Bucket, destination: &'a dyn Bucket) -> Self {
        Self {
            source,
            destination,
            prefix: String::new(),
            concurrency: 1,
            state: MigrationState::Unstarted,
        }
    }

    /// Copy up to `concurrency` keys at once. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Restrict the next run to keys starting with `prefix`
    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Copy every source object under the prefix that the destination lacks
    ///
    /// Stops at the first failure and returns it; objects copied before the
    /// failure stay in the destination. Completed and failed jobs can be run
    /// again.
    pub async fn run(
        &mut self,
        ctx: &CancellationToken,
    ) -> Result<MigrationReport, MigrationError> {
        self.state = MigrationState::Running;
        let start = std::time::Instant::now();

        let result = self.copy_all(ctx).await;

        match result {
            Ok(ref report) => {
                self.state = MigrationState::Completed;
                tracing::info!(
                    source = %self.source.location(),
                    destination = %self.destination.location(),
                    prefix = %self.prefix,
                    copied = report.copied,
                    skipped = report.skipped,
                    size_bytes = report.bytes,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Migration completed"
                );
            }
            Err(ref e) => {
                self.state = MigrationState::Failed;
                tracing::error!(
                    source = %self.source.location(),
                    destination = %self.destination.location(),
                    prefix = %self.prefix,
                    error = %e,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Migration failed"
                );
            }
        }

        result
    }

    async fn copy_all(&self, ctx: &CancellationToken) -> Result<MigrationReport, MigrationError> {
        let tally = Tally::default();
        // Cancelled on the first failure so in-flight copies wind down and
        // clean up before the error is returned.
        let run_ctx = ctx.child_token();
        let _stop = run_ctx.clone().drop_guard();

        // Every pull from the listing is a cancellation point too.
        let listing = self.source.list(&self.prefix);
        let mut records = futures::stream::unfold(listing, |mut listing| {
            let run_ctx = &run_ctx;
            async move {
                match with_cancellation(run_ctx, listing.next()).await {
                    Ok(Some(item)) => Some((item, listing)),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), listing)),
                }
            }
        })
        .boxed();

        // Listing yields each key once, so a key is only ever handled by one
        // task and its exists/write pair cannot race with itself.
        let mut in_flight = FuturesUnordered::new();
        let mut exhausted = false;
        let mut first_error: Option<MigrationError> = None;

        loop {
            while !exhausted && first_error.is_none() && in_flight.len() < self.concurrency {
                match records.next().await {
                    Some(Ok(record)) => {
                        in_flight.push(self.copy_object(&run_ctx, record, &tally));
                    }
                    Some(Err(source)) => {
                        first_error = Some(MigrationError::List {
                            prefix: self.prefix.clone(),
                            source,
                        });
                        run_ctx.cancel();
                    }
                    None => exhausted = true,
                }
            }

            match in_flight.next().await {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                        run_ctx.cancel();
                    }
                }
                None => break,
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(MigrationReport {
            prefix: self.prefix.clone(),
            copied: tally.copied.load(Ordering::Relaxed),
            skipped: tally.skipped.load(Ordering::Relaxed),
            bytes: tally.bytes.load(Ordering::Relaxed),
        })
    }

    async fn copy_object(
        &self,
        ctx: &CancellationToken,
        record: ObjectRecord,
        tally: &Tally,
    ) -> Result<(), MigrationError> {
        let key = record.key;
        let fail = |step: MigrationStep| {
            let key = key.clone();
            move |source: StorageError| MigrationError::Object { step, key, source }
        };

        if self
            .destination
            .exists(ctx, &key)
            .await
            .map_err(fail(MigrationStep::Exists))?
        {
            tally.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "Destination already has object, skipping");
            return Ok(());
        }

        let content = self
            .source
            .read(ctx, &key)
            .await
            .map_err(fail(MigrationStep::Read))?;

        // The source stream is consumed (and dropped) by write, whether or not
        // it succeeds. Errors raised while pulling from it are read failures.
        let written = self
            .destination
            .write(ctx, &key, content)
            .await
            .map_err(|source| {
                let step = match source {
                    StorageError::ReadFailed { .. } => MigrationStep::Read,
                    _ => MigrationStep::Write,
                };
                fail(step)(source)
            })?;

        tally.copied.fetch_add(1, Ordering::Relaxed);
        tally.bytes.fetch_add(written, Ordering::Relaxed);

        tracing::debug!(
            key = %key,
            size_bytes = written,
            listed_size_bytes = record.size,
            "Copied object"
        );

        Ok(())
    }
}

/// Failure of one well-known prefix, which aborts the remaining ones
#[derive(Debug, Error)]
#[error("failed to migrate from source with prefix {prefix}: {source}")]
pub struct PrefixMigrationError {
    pub prefix: String,
    #[source]
    pub source: MigrationError,
}

/// Migrate each upload directory in turn
///
/// Directories configured as absolute paths live outside managed storage and
/// are skipped. Relative ones are normalized and migrated as `<path>/` so
/// that sibling directories sharing a name prefix are not swept in. Returns one report per
/// migrated directory, or the first failure.
pub async fn migrate_prefixes(
    source: &dyn Bucket,
    destination: &dyn Bucket,
    prefixes: &[UploadPrefix],
    concurrency: usize,
    ctx: &CancellationToken,
) -> Result<Vec<MigrationReport>, PrefixMigrationError> {
    let mut migration = Migration::new(source, destination).with_concurrency(concurrency);
    let mut reports = Vec::with_capacity(prefixes.len());

    for prefix in prefixes {
        if prefix.is_external() {
            tracing::debug!(
                name = prefix.name,
                path = %prefix.path,
                "Path is outside managed storage, skipping"
            );
            continue;
        }

        migration.set_prefix(prefix.key_prefix());

        let report = migration
            .run(ctx)
            .await
            .map_err(|source| PrefixMigrationError {
                prefix: prefix.path.clone(),
                source,
            })?;
        reports.push(report);
    }

    Ok(reports)
}

#[cfg(all(test, feature = "storage-cloud"))]
mod tests {
    use super::*;
    use crate::traits::{ObjectListing, ObjectStream, StorageResult};
    use crate::{BucketKind, CloudBucket};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::TryStreamExt;
    use std::sync::atomic::AtomicUsize;

    fn content(data: &[u8]) -> ObjectStream {
        let data = Bytes::copy_from_slice(data);
        Box::pin(futures::stream::iter(vec![Ok(data)]))
    }

    async fn put(bucket: &dyn Bucket, key: &str, data: &[u8]) {
        let ctx = CancellationToken::new();
        bucket.write(&ctx, key, content(data)).await.unwrap();
    }

    async fn get(bucket: &dyn Bucket, key: &str) -> Vec<u8> {
        let ctx = CancellationToken::new();
        let chunks: Vec<Bytes> = bucket
            .read(&ctx, key)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    async fn keys(bucket: &dyn Bucket) -> Vec<String> {
        let mut keys: Vec<String> = bucket
            .list("")
            .map_ok(|r| r.key)
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        keys
    }

    /// Delegates to an in-memory bucket, failing the nth write
    struct FailingBucket {
        inner: CloudBucket,
        fail_on_write: usize,
        writes: AtomicUsize,
    }

    impl FailingBucket {
        fn new(fail_on_write: usize) -> Self {
            Self {
                inner: CloudBucket::in_memory("failing", None),
                fail_on_write,
                writes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Bucket for FailingBucket {
        fn kind(&self) -> BucketKind {
            self.inner.kind()
        }

        fn location(&self) -> &str {
            self.inner.location()
        }

        async fn read(&self, ctx: &CancellationToken, key: &str) -> StorageResult<ObjectStream> {
            self.inner.read(ctx, key).await
        }

        async fn write(
            &self,
            ctx: &CancellationToken,
            key: &str,
            content: ObjectStream,
        ) -> StorageResult<u64> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on_write {
                return Err(StorageError::WriteFailed {
                    key: key.to_string(),
                    message: "storage removed".to_string(),
                });
            }
            self.inner.write(ctx, key, content).await
        }

        fn list(&self, prefix: &str) -> ObjectListing {
            self.inner.list(prefix)
        }

        async fn exists(&self, ctx: &CancellationToken, key: &str) -> StorageResult<bool> {
            self.inner.exists(ctx, key).await
        }

        async fn close(&self) -> StorageResult<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn copies_everything_without_prefix() {
        let src = CloudBucket::in_memory("src", None);
        let dst = CloudBucket::in_memory("dst", None);
        put(&src, "a", b"one").await;
        put(&src, "b/c", b"two").await;

        let mut migration = Migration::new(&src, &dst);
        assert_eq!(migration.state(), MigrationState::Unstarted);

        let report = migration.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(migration.state(), MigrationState::Completed);
        assert_eq!(report.copied, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.bytes, 6);
        assert_eq!(keys(&dst).await, vec!["a", "b/c"]);
        assert_eq!(get(&dst, "b/c").await, b"two");
    }

    #[tokio::test]
    async fn skips_existing_destination_objects() {
        let src = CloudBucket::in_memory("src", None);
        let dst = CloudBucket::in_memory("dst", None);
        put(&src, "a", b"new").await;
        put(&dst, "a", b"stale").await;

        let report = Migration::new(&src, &dst)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.copied, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(get(&dst, "a").await, b"stale");
    }

    #[tokio::test]
    async fn stops_at_first_failed_write() {
        let src = CloudBucket::in_memory("src", None);
        for key in ["1", "2", "3", "4"] {
            put(&src, key, b"x").await;
        }
        let dst = FailingBucket::new(2);

        let mut migration = Migration::new(&src, &dst);
        let err = migration.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(migration.state(), MigrationState::Failed);
        assert!(matches!(
            err,
            MigrationError::Object {
                step: MigrationStep::Write,
                ..
            }
        ));
        assert!(!err.is_cancelled());
        assert_eq!(dst.writes.load(Ordering::SeqCst), 2);
        assert_eq!(keys(&dst).await.len(), 1);

        // Resuming copies only what is missing.
        let report = migration.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.copied, 3);
        assert_eq!(keys(&dst).await.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_copy_is_complete() {
        let src = CloudBucket::in_memory("src", None);
        let dst = CloudBucket::in_memory("dst", None);
        for i in 0..50 {
            put(&src, &format!("data/{i:02}"), format!("payload {i}").as_bytes()).await;
        }

        let report = Migration::new(&src, &dst)
            .with_concurrency(8)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.copied, 50);
        assert_eq!(keys(&dst).await, keys(&src).await);
        assert_eq!(get(&dst, "data/07").await, b"payload 7");
    }

    #[tokio::test]
    async fn cancelled_run_reports_cancellation() {
        let src = CloudBucket::in_memory("src", None);
        let dst = CloudBucket::in_memory("dst", None);
        put(&src, "a", b"x").await;

        let ctx = CancellationToken::new();
        ctx.cancel();

        let mut migration = Migration::new(&src, &dst);
        let err = migration.run(&ctx).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(migration.state(), MigrationState::Failed);
        assert!(keys(&dst).await.is_empty());
    }

    #[tokio::test]
    async fn closed_source_fails_listing() {
        let src = CloudBucket::in_memory("src", None);
        let dst = CloudBucket::in_memory("dst", None);
        src.close().await.unwrap();

        let err = Migration::new(&src, &dst)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MigrationError::List {
                source: StorageError::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn prefix_driver_skips_external_paths_and_scopes_dirs() {
        let src = CloudBucket::in_memory("src", None);
        let dst = CloudBucket::in_memory("dst", None);
        put(&src, "data/avatars/1", b"a").await;
        put(&src, "data/avatars-old/1", b"b").await;
        put(&src, "data/attachments/x/y", b"c").await;

        let prefixes = vec![
            UploadPrefix::new("avatars", "data/avatars"),
            UploadPrefix::new("attachments", "data/attachments/"),
            UploadPrefix::new("lfs", "/mnt/lfs"),
        ];

        let reports = migrate_prefixes(&src, &dst, &prefixes, 1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].prefix, "data/avatars/");
        assert_eq!(reports[1].prefix, "data/attachments/");
        assert_eq!(
            keys(&dst).await,
            vec!["data/attachments/x/y", "data/avatars/1"]
        );
    }

    #[tokio::test]
    async fn prefix_driver_accepts_dot_relative_paths() {
        let src = CloudBucket::in_memory("src", None);
        let dst = CloudBucket::in_memory("dst", None);
        put(&src, "data/avatars/1", b"a").await;

        let prefixes = vec![UploadPrefix::new("avatars", "./data//avatars")];

        let reports = migrate_prefixes(&src, &dst, &prefixes, 1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reports[0].prefix, "data/avatars/");
        assert_eq!(reports[0].copied, 1);
        assert_eq!(keys(&dst).await, vec!["data/avatars/1"]);
    }

    #[tokio::test]
    async fn prefix_driver_aborts_on_first_failure() {
        let src = CloudBucket::in_memory("src", None);
        put(&src, "data/avatars/1", b"a").await;
        put(&src, "data/attachments/1", b"b").await;
        let dst = FailingBucket::new(1);

        let prefixes = vec![
            UploadPrefix::new("avatars", "data/avatars"),
            UploadPrefix::new("attachments", "data/attachments"),
        ];

        let err = migrate_prefixes(&src, &dst, &prefixes, 1, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.prefix, "data/avatars");
        assert_eq!(dst.writes.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("data/avatars"));
    }

    #[test]
    fn zero_concurrency_means_one() {
        let src = CloudBucket::in_memory("src", None);
        let dst = CloudBucket::in_memory("dst", None);
        let migration = Migration::new(&src, &dst).with_concurrency(0);
        assert_eq!(migration.concurrency, 1);
    }
}
