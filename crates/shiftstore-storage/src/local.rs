use crate::keys::{
    dir_may_match, is_partial_name, prefix_dir, validate_key, validate_prefix, PARTIAL_SUFFIX,
};
use crate::traits::{
    failed_listing, with_cancellation, Bucket, ObjectListing, ObjectRecord, ObjectStream,
    StorageError, StorageResult,
};
use crate::BucketKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Local filesystem bucket
///
/// Keys map to files below `root`; `a/b/c` is stored at `root/a/b/c`.
pub struct LocalBucket {
    root: PathBuf,
    location: String,
    closed: AtomicBool,
}

impl LocalBucket {
    /// Open a bucket rooted at `root`
    ///
    /// The directory is created if missing. Nothing below it is read.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();

        fs::create_dir_all(&root).await.map_err(|e| {
            StorageError::Open(format!(
                "Failed to create storage directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let root = fs::canonicalize(&root).await.map_err(|e| {
            StorageError::Open(format!(
                "Failed to resolve storage directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let metadata = fs::metadata(&root)
            .await
            .map_err(|e| StorageError::Open(format!("{}: {}", root.display(), e)))?;
        if !metadata.is_dir() {
            return Err(StorageError::Open(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        tracing::debug!(root = %root.display(), "Opened local bucket");

        Ok(LocalBucket {
            location: root.display().to_string(),
            root,
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Convert a key to a filesystem path with traversal validation
    ///
    /// Rejects keys that are not plain relative paths and keys whose existing
    /// target resolves (through symlinks) outside the bucket root.
    async fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;

        let path = self.root.join(key);

        if let Ok(canonical) = fs::canonicalize(&path).await {
            if canonical.strip_prefix(&self.root).is_err() {
                return Err(StorageError::InvalidKey(format!(
                    "{:?} resolves outside the bucket root",
                    key
                )));
            }
        }

        Ok(path)
    }

    /// Fail if the root directory has disappeared since open
    async fn ensure_root(&self) -> std::io::Result<()> {
        let metadata = fs::metadata(&self.root).await?;
        if !metadata.is_dir() {
            return Err(std::io::Error::other(format!(
                "bucket root {} is no longer a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn write_partial(
        ctx: &CancellationToken,
        key: &str,
        partial: &Path,
        content: &mut ObjectStream,
    ) -> StorageResult<u64> {
        let write_failed = |e: std::io::Error| StorageError::WriteFailed {
            key: key.to_string(),
            message: format!("{}: {}", partial.display(), e),
        };

        let mut file = fs::File::create(partial).await.map_err(write_failed)?;
        let mut size = 0u64;

        while let Some(chunk) = with_cancellation(ctx, content.next()).await? {
            let chunk = chunk?;
            with_cancellation(ctx, file.write_all(&chunk))
                .await?
                .map_err(write_failed)?;
            size += chunk.len() as u64;
        }

        file.sync_all().await.map_err(write_failed)?;
        Ok(size)
    }
}

/// Hidden sibling used while a write is in progress
///
/// Deleted on drop unless the write reached its final name.
struct PartialFile {
    path: PathBuf,
    persisted: bool,
}

impl PartialFile {
    fn new(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = target.with_file_name(format!(
            ".{}.{}{}",
            name,
            Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persisted(mut self) {
        self.persisted = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove partial file"
            ),
        }
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    fn kind(&self) -> BucketKind {
        BucketKind::Local
    }

    fn location(&self) -> &str {
        &self.location
    }

    async fn read(&self, ctx: &CancellationToken, key: &str) -> StorageResult<ObjectStream> {
        self.ensure_open()?;
        let path = self.key_to_path(key).await?;

        let file = match with_cancellation(ctx, fs::File::open(&path)).await? {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => {
                return Err(StorageError::ReadFailed {
                    key: key.to_string(),
                    message: format!("Failed to open file {}: {}", path.display(), e),
                })
            }
        };

        let metadata = file.metadata().await.map_err(|e| StorageError::ReadFailed {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let key = key.to_string();
        let stream = tokio_util::io::ReaderStream::new(file).map(move |result| {
            result.map_err(|e| {
                tracing::error!(key = %key, error = %e, "Local bucket read error");
                StorageError::ReadFailed {
                    key: key.clone(),
                    message: format!("Failed to read chunk: {}", e),
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
        let path = self.key_to_path(key).await?;
        let start = std::time::Instant::now();

        let write_failed = |e: std::io::Error| StorageError::WriteFailed {
            key: key.to_string(),
            message: e.to_string(),
        };

        // Parent directories are created below the root only; a vanished root
        // means the storage is gone.
        self.ensure_root().await.map_err(write_failed)?;
        if let Some(parent) = path.parent() {
            with_cancellation(ctx, fs::create_dir_all(parent))
                .await?
                .map_err(write_failed)?;
        }

        // Removed on every exit path, including the future being dropped.
        let partial = PartialFile::new(&path);
        let size = Self::write_partial(ctx, key, partial.path(), &mut content).await?;

        fs::rename(partial.path(), &path)
            .await
            .map_err(write_failed)?;
        partial.persisted();

        tracing::debug!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local bucket write successful"
        );

        Ok(size)
    }

    fn list(&self, prefix: &str) -> ObjectListing {
        if let Err(e) = self.ensure_open().and_then(|_| validate_prefix(prefix)) {
            return failed_listing(e);
        }

        let start_dir = prefix_dir(prefix);
        let walk = Walk {
            root: self.root.clone(),
            prefix: prefix.to_string(),
            pending: vec![(self.root.join(start_dir), start_dir.to_string())],
            ready: VecDeque::new(),
            started: false,
        };

        Box::pin(futures::stream::try_unfold(walk, |mut walk| async move {
            match walk.next_record().await? {
                Some(record) => Ok(Some((record, walk))),
                None => Ok(None),
            }
        }))
    }

    async fn exists(&self, ctx: &CancellationToken, key: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        let path = self.key_to_path(key).await?;

        match with_cancellation(ctx, fs::metadata(&path)).await? {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::ExistsFailed {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(root = %self.root.display(), "Closed local bucket");
        }
        Ok(())
    }
}

/// Depth-first directory walk holding one directory's entries at a time
struct Walk {
    root: PathBuf,
    prefix: String,
    /// Directories still to read, with their key relative to the root
    pending: Vec<(PathBuf, String)>,
    ready: VecDeque<ObjectRecord>,
    started: bool,
}

impl Walk {
    async fn next_record(&mut self) -> StorageResult<Option<ObjectRecord>> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Ok(Some(record));
            }
            let Some((dir, dir_key)) = self.pending.pop() else {
                return Ok(None);
            };
            let first = !self.started;
            self.started = true;
            self.read_dir(&dir, &dir_key, first).await?;
        }
    }

    async fn read_dir(&mut self, dir: &Path, dir_key: &str, first: bool) -> StorageResult<()> {
        let list_failed = |message: String| StorageError::ListFailed {
            prefix: self.prefix.clone(),
            message,
        };

        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            // A missing prefix directory, or one removed mid-walk, has no objects.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            // The root itself must be readable; a prefix that names a file
            // instead of a directory simply matches nothing.
            Err(e) if !first || dir == self.root => {
                return Err(list_failed(format!("{}: {}", dir.display(), e)))
            }
            Err(_) => return Ok(()),
        };

        let mut files = Vec::new();
        let mut subdirs = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| list_failed(format!("{}: {}", dir.display(), e)))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                tracing::warn!(dir = %dir.display(), "Skipping non UTF-8 file name");
                continue;
            };
            if is_partial_name(name) {
                continue;
            }

            let key = if dir_key.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", dir_key, name)
            };

            // Symbolic links are not objects.
            let metadata = match fs::symlink_metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(list_failed(format!("{}: {}", key, e))),
            };
            if metadata.file_type().is_symlink() {
                tracing::debug!(key = %key, "Skipping symbolic link");
                continue;
            }

            if metadata.is_dir() {
                if dir_may_match(&key, &self.prefix) {
                    subdirs.push((entry.path(), key));
                }
            } else if metadata.is_file() && key.starts_with(&self.prefix) {
                let last_modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_default();
                files.push(ObjectRecord {
                    key,
                    size: metadata.len(),
                    last_modified,
                });
            }
        }

        files.sort_by(|a, b| a.key.cmp(&b.key));
        self.ready.extend(files);

        // Popped from the back, so reverse to visit subdirectories in order.
        subdirs.sort_by(|a, b| b.1.cmp(&a.1));
        self.pending.extend(subdirs);

        Ok(())
    }
}
