#[cfg(feature = "storage-cloud")]
use crate::CloudBucket;
#[cfg(feature = "storage-local")]
use crate::LocalBucket;
use crate::{Bucket, Locator, StorageResult};
use shiftstore_core::Config;
use std::sync::Arc;

/// Open a bucket for `locator`
///
/// The empty locator opens `config.default_bucket`. Opening only sets up the
/// connection; no object is read or listed.
pub async fn open_bucket(config: &Config, locator: &str) -> StorageResult<Arc<dyn Bucket>> {
    let locator = Locator::resolve(locator, config)?;

    match locator {
        #[cfg(feature = "storage-local")]
        Locator::Local(path) => {
            let bucket = LocalBucket::open(path).await?;
            Ok(Arc::new(bucket))
        }

        #[cfg(not(feature = "storage-local"))]
        Locator::Local(_) => Err(crate::StorageError::Open(
            "Local bucket backend not available (storage-local feature not enabled)".to_string(),
        )),

        #[cfg(feature = "storage-cloud")]
        Locator::S3 {
            bucket,
            root,
            region,
            endpoint,
        } => {
            let region = region.or_else(|| config.s3_region.clone());
            let endpoint = endpoint.or_else(|| config.s3_endpoint.clone());
            let bucket = CloudBucket::s3(bucket, root, region, endpoint)?;
            tracing::debug!(bucket = %bucket.location(), "Opened s3 bucket");
            Ok(Arc::new(bucket))
        }

        #[cfg(feature = "storage-cloud")]
        Locator::Memory { name, root } => Ok(Arc::new(CloudBucket::in_memory(&name, root))),

        #[cfg(not(feature = "storage-cloud"))]
        Locator::S3 { .. } | Locator::Memory { .. } => Err(crate::StorageError::Open(
            "Cloud bucket backend not available (storage-cloud feature not enabled)".to_string(),
        )),
    }
}
