//! Configuration module
//!
//! This module provides the configuration consumed by bucket opening and the
//! storage migration command: the managed storage root, the default bucket
//! locator, the well-known upload directories, and cloud fallbacks.

use std::env;
use std::path::PathBuf;

use crate::constants::{
    UploadPrefix, DEFAULT_ATTACHMENT_PATH, DEFAULT_AVATAR_UPLOAD_PATH, DEFAULT_LFS_CONTENT_PATH,
    DEFAULT_MIGRATION_CONCURRENCY, DEFAULT_REPOSITORY_AVATAR_UPLOAD_PATH,
};

/// Application configuration.
///
/// Passed explicitly into `open_bucket` and the migration driver; nothing in
/// the storage crate reads process-wide state.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root of the managed local storage
    pub app_work_path: PathBuf,
    /// Locator used when `open_bucket` is given an empty string
    pub default_bucket: Option<String>,
    pub avatar_upload_path: String,
    pub attachment_path: String,
    pub lfs_content_path: String,
    pub repository_avatar_upload_path: String,
    // Cloud fallbacks for s3:// locators without query parameters
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub migration_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_work_path: PathBuf::from("."),
            default_bucket: None,
            avatar_upload_path: DEFAULT_AVATAR_UPLOAD_PATH.to_string(),
            attachment_path: DEFAULT_ATTACHMENT_PATH.to_string(),
            lfs_content_path: DEFAULT_LFS_CONTENT_PATH.to_string(),
            repository_avatar_upload_path: DEFAULT_REPOSITORY_AVATAR_UPLOAD_PATH.to_string(),
            s3_region: None,
            s3_endpoint: None,
            migration_concurrency: DEFAULT_MIGRATION_CONCURRENCY,
        }
    }
}

impl Config {
    /// Load configuration from the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|s| !s.trim().is_empty());

        let app_work_path = match non_empty("APP_WORK_PATH") {
            Some(path) => PathBuf::from(path),
            None => env::current_dir()
                .map_err(|e| anyhow::anyhow!("Failed to resolve working directory: {}", e))?,
        };

        let migration_concurrency = match non_empty("MIGRATION_CONCURRENCY") {
            Some(value) => value.trim().parse::<usize>().map_err(|_| {
                anyhow::anyhow!("MIGRATION_CONCURRENCY must be a positive integer")
            })?,
            None => DEFAULT_MIGRATION_CONCURRENCY,
        };

        let config = Config {
            app_work_path,
            default_bucket: non_empty("BUCKET_URL"),
            avatar_upload_path: non_empty("AVATAR_UPLOAD_PATH")
                .unwrap_or_else(|| DEFAULT_AVATAR_UPLOAD_PATH.to_string()),
            attachment_path: non_empty("ATTACHMENT_PATH")
                .unwrap_or_else(|| DEFAULT_ATTACHMENT_PATH.to_string()),
            lfs_content_path: non_empty("LFS_CONTENT_PATH")
                .unwrap_or_else(|| DEFAULT_LFS_CONTENT_PATH.to_string()),
            repository_avatar_upload_path: non_empty("REPOSITORY_AVATAR_UPLOAD_PATH")
                .unwrap_or_else(|| DEFAULT_REPOSITORY_AVATAR_UPLOAD_PATH.to_string()),
            s3_region: non_empty("S3_REGION").or_else(|| non_empty("AWS_REGION")),
            s3_endpoint: non_empty("S3_ENDPOINT"),
            migration_concurrency,
        };

        config.validate()?;

        tracing::trace!(
            app_work_path = %config.app_work_path.display(),
            default_bucket = ?config.default_bucket,
            "Configuration loaded"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.app_work_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("APP_WORK_PATH must not be empty"));
        }

        if self.migration_concurrency == 0 {
            return Err(anyhow::anyhow!(
                "MIGRATION_CONCURRENCY must be at least 1"
            ));
        }

        for prefix in self.upload_prefixes() {
            if prefix.path.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "Upload path for {} must not be empty",
                    prefix.name
                ));
            }
        }

        Ok(())
    }

    /// The well-known upload directories, in migration order.
    pub fn upload_prefixes(&self) -> Vec<UploadPrefix> {
        vec![
            UploadPrefix::new("avatars", self.avatar_upload_path.clone()),
            UploadPrefix::new("attachments", self.attachment_path.clone()),
            UploadPrefix::new("lfs", self.lfs_content_path.clone()),
            UploadPrefix::new(
                "repository-avatars",
                self.repository_avatar_upload_path.clone(),
            ),
        ]
    }

    /// Return a copy whose default bucket is `locator`.
    pub fn with_default_bucket(mut self, locator: impl Into<String>) -> Self {
        self.default_bucket = Some(locator.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[("APP_WORK_PATH", "/srv/app")])).unwrap();

        assert_eq!(config.app_work_path, PathBuf::from("/srv/app"));
        assert_eq!(config.default_bucket, None);
        assert_eq!(config.migration_concurrency, 1);

        let paths: Vec<String> = config
            .upload_prefixes()
            .into_iter()
            .map(|p| p.path)
            .collect();
        assert_eq!(
            paths,
            vec![
                "data/avatars",
                "data/attachments",
                "data/lfs",
                "data/repo-avatars"
            ]
        );
    }

    #[test]
    fn overrides_and_region_fallback() {
        let config = Config::from_lookup(lookup(&[
            ("APP_WORK_PATH", "/srv/app"),
            ("BUCKET_URL", "s3://media"),
            ("LFS_CONTENT_PATH", "/mnt/lfs"),
            ("AWS_REGION", "eu-west-1"),
            ("MIGRATION_CONCURRENCY", "8"),
        ]))
        .unwrap();

        assert_eq!(config.default_bucket.as_deref(), Some("s3://media"));
        assert_eq!(config.lfs_content_path, "/mnt/lfs");
        assert_eq!(config.s3_region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.migration_concurrency, 8);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = Config::from_lookup(lookup(&[
            ("APP_WORK_PATH", "/srv/app"),
            ("BUCKET_URL", "   "),
        ]))
        .unwrap();
        assert_eq!(config.default_bucket, None);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("APP_WORK_PATH", "/srv/app"),
            ("MIGRATION_CONCURRENCY", "0"),
        ]));
        assert!(result.is_err());

        let result = Config::from_lookup(lookup(&[
            ("APP_WORK_PATH", "/srv/app"),
            ("MIGRATION_CONCURRENCY", "many"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn with_default_bucket_overrides() {
        let config = Config::default().with_default_bucket("mem://scratch");
        assert_eq!(config.default_bucket.as_deref(), Some("mem://scratch"));
    }
}
