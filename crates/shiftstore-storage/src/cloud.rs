use crate::keys::{prefix_dir, validate_key, validate_prefix};
use crate::traits::{
    failed_listing, with_cancellation, Bucket, ObjectListing, ObjectRecord, ObjectStream,
    StorageError, StorageResult,
};
use crate::BucketKind;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{ObjectMeta, ObjectStore, ObjectStoreExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Cloud bucket backed by an `object_store` implementation
///
/// An optional `root` scopes every key: with root `uploads`, key `a/b` lives at
/// `uploads/a/b` in the underlying store and is listed back as `a/b`.
pub struct CloudBucket {
    store: Arc<dyn ObjectStore>,
    root: Option<String>,
    location: String,
    closed: AtomicBool,
}

impl CloudBucket {
    /// Open an S3 (or S3-compatible) bucket
    ///
    /// # Arguments
    /// * `bucket` - S3 bucket name
    /// * `root` - Optional key prefix inside the bucket
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - Optional custom endpoint for S3-compatible providers
    ///   (e.g., "http://localhost:9000" for MinIO)
    ///
    /// Credentials come from the environment. No request is made here.
    pub fn s3(
        bucket: String,
        root: Option<String>,
        region: Option<String>,
        endpoint_url: Option<String>,
    ) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket.clone());

        if let Some(region) = region {
            builder = builder.with_region(region);
        }

        if let Some(ref endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::Open(format!("s3 bucket {}: {}", bucket, e)))?;

        let location = match endpoint_url {
            Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), bucket),
            None => format!("s3://{}", bucket),
        };

        Ok(Self::from_store(Arc::new(store), root, location))
    }

    /// Open an empty in-process bucket
    pub fn in_memory(name: &str, root: Option<String>) -> Self {
        Self::from_store(
            Arc::new(InMemory::new()),
            root,
            format!("mem://{}", name),
        )
    }

    /// Wrap an already configured store
    pub fn from_store(
        store: Arc<dyn ObjectStore>,
        root: Option<String>,
        location: impl Into<String>,
    ) -> Self {
        let root = root
            .map(|r| r.trim_matches('/').to_string())
            .filter(|r| !r.is_empty());
        let mut location = location.into();
        if let Some(ref root) = root {
            location = format!("{}/{}", location, root);
        }

        CloudBucket {
            store,
            root,
            location,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Store path for a key, below the root
    fn object_path(&self, key: &str) -> StorageResult<Path> {
        validate_key(key)?;
        let full = match self.root {
            Some(ref root) => format!("{}/{}", root, key),
            None => key.to_string(),
        };
        Path::parse(full).map_err(|e| StorageError::InvalidKey(e.to_string()))
    }

    /// Store path of the directory a listing starts from
    fn listing_path(&self, prefix: &str) -> StorageResult<Option<Path>> {
        let dir = prefix_dir(prefix);
        let full = match (self.root.as_deref(), dir) {
            (None, "") => return Ok(None),
            (Some(root), "") => root.to_string(),
            (None, dir) => dir.to_string(),
            (Some(root), dir) => format!("{}/{}", root, dir),
        };
        Path::parse(full)
            .map(Some)
            .map_err(|e| StorageError::InvalidKey(e.to_string()))
    }
}

/// An upload that has not completed yet
///
/// Dropping it before `completed` aborts the upload in the background, so a
/// write abandoned mid-stream does not leave multipart parts behind.
struct PendingUpload {
    writer: Option<BufWriter>,
    key: String,
}

impl PendingUpload {
    fn new(writer: BufWriter, key: &str) -> Self {
        Self {
            writer: Some(writer),
            key: key.to_string(),
        }
    }

    fn writer(&mut self) -> StorageResult<&mut BufWriter> {
        self.writer
            .as_mut()
            .ok_or_else(|| StorageError::WriteFailed {
                key: self.key.clone(),
                message: "upload already finished".to_string(),
            })
    }

    fn completed(mut self) {
        self.writer = None;
    }

    async fn abort(mut self) -> object_store::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.abort().await,
            None => Ok(()),
        }
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "No runtime to abort abandoned cloud upload");
            return;
        };
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            if let Err(e) = writer.abort().await {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Failed to abort abandoned cloud upload"
                );
            }
        });
    }
}

/// Key of a listed object relative to the root, if it lies below it
fn relative_key(meta: &ObjectMeta, root: Option<&str>) -> Option<String> {
    let location = meta.location.as_ref();
    match root {
        Some(root) => location
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string),
        None => Some(location.to_string()),
    }
}

#[async_trait]
impl Bucket for CloudBucket {
    fn kind(&self) -> BucketKind {
        BucketKind::Cloud
    }

    fn location(&self) -> &str {
        &self.location
    }

    async fn read(&self, ctx: &CancellationToken, key: &str) -> StorageResult<ObjectStream> {
        self.ensure_open()?;
        let path = self.object_path(key)?;
        let start = std::time::Instant::now();

        let result = with_cancellation(ctx, self.store.get(&path))
            .await?
            .map_err(|e| match e {
                ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.to_string()),
                other => {
                    tracing::error!(
                        error = %other,
                        bucket = %self.location,
                        key = %key,
                        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "Cloud read failed"
                    );
                    StorageError::ReadFailed {
                        key: key.to_string(),
                        message: other.to_string(),
                    }
                }
            })?;

        let key = key.to_string();
        let stream = result.into_stream().map(move |res| {
            res.map_err(|e| {
                tracing::error!(key = %key, error = %e, "Cloud stream read error");
                StorageError::ReadFailed {
                    key: key.clone(),
                    message: e.to_string(),
                }
            })
        });

        Ok(Box::pin(stream))
    }

    async fn write(
        &self,
        ctx: &CancellationToken,
        key: &str,
        mut content: ObjectStream,
    ) -> StorageResult<u64> {
        self.ensure_open()?;
        let path = self.object_path(key)?;
        let start = std::time::Instant::now();

        // Small objects go up in one PUT, large ones as a multipart upload;
        // either way nothing is visible under the key until completion.
        let writer = BufWriter::new(Arc::clone(&self.store), path);
        let mut upload = PendingUpload::new(writer, key);
        let mut size = 0u64;

        let outcome: StorageResult<()> = async {
            let write_failed = |e: std::io::Error| StorageError::WriteFailed {
                key: key.to_string(),
                message: e.to_string(),
            };
            let writer = upload.writer()?;
            while let Some(chunk) = with_cancellation(ctx, content.next()).await? {
                let chunk = chunk?;
                with_cancellation(ctx, writer.write_all(&chunk))
                    .await?
                    .map_err(write_failed)?;
                size += chunk.len() as u64;
            }
            with_cancellation(ctx, writer.shutdown())
                .await?
                .map_err(write_failed)
        }
        .await;

        if let Err(e) = outcome {
            if let Err(abort_err) = upload.abort().await {
                tracing::warn!(
                    key = %key,
                    error = %abort_err,
                    "Failed to abort cloud upload"
                );
            }
            tracing::error!(
                error = %e,
                bucket = %self.location,
                key = %key,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Cloud write failed"
            );
            return Err(e);
        }
        upload.completed();

        tracing::debug!(
            bucket = %self.location,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Cloud write successful"
        );

        Ok(size)
    }

    fn list(&self, prefix: &str) -> ObjectListing {
        let listing_path = match self
            .ensure_open()
            .and_then(|_| validate_prefix(prefix))
            .and_then(|_| self.listing_path(prefix))
        {
            Ok(path) => path,
            Err(e) => return failed_listing(e),
        };

        let root = self.root.clone();
        let wanted = prefix.to_string();
        let failed_prefix = prefix.to_string();

        // object_store pages through the provider's listing underneath.
        self.store
            .list(listing_path.as_ref())
            .map_err(move |e| StorageError::ListFailed {
                prefix: failed_prefix.clone(),
                message: e.to_string(),
            })
            .try_filter_map(move |meta| {
                let record = relative_key(&meta, root.as_deref())
                    .filter(|key| key.starts_with(&wanted))
                    .map(|key| ObjectRecord {
                        key,
                        size: meta.size as u64,
                        last_modified: meta.last_modified,
                    });
                futures::future::ready(Ok(record))
            })
            .boxed()
    }

    async fn exists(&self, ctx: &CancellationToken, key: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        let path = self.object_path(key)?;

        match with_cancellation(ctx, self.store.head(&path)).await? {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::ExistsFailed {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(bucket = %self.location, "Closed cloud bucket");
        }
        Ok(())
    }
}
