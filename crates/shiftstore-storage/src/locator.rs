//! Bucket locators
//!
//! A locator is the connection string handed to `open_bucket`. Its shape picks
//! the backend:
//!
//! - a plain path (`/var/lib/app`, `data`) or a `file://` URL: local filesystem
//! - `s3://bucket[/root][?region=..&endpoint=..]`: cloud bucket on S3 or an
//!   S3-compatible provider
//! - `mem://[name][/root]`: in-process cloud bucket, mostly for tests
//! - the empty string: the configured default bucket

use crate::keys::validate_prefix;
use crate::traits::{StorageError, StorageResult};
use crate::BucketKind;
use shiftstore_core::Config;
use std::path::PathBuf;
use url::Url;

/// A parsed bucket locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Local(PathBuf),
    S3 {
        bucket: String,
        root: Option<String>,
        region: Option<String>,
        endpoint: Option<String>,
    },
    Memory {
        name: String,
        root: Option<String>,
    },
}

impl Locator {
    /// Parse a locator, substituting the configured default for `""`.
    pub fn resolve(locator: &str, config: &Config) -> StorageResult<Self> {
        if locator.trim().is_empty() {
            let default = config
                .default_bucket
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| {
                    StorageError::Open(
                        "empty locator and no default bucket configured (BUCKET_URL)"
                            .to_string(),
                    )
                })?;
            return Self::parse(default);
        }
        Self::parse(locator)
    }

    /// Parse a non-empty locator.
    pub fn parse(locator: &str) -> StorageResult<Self> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(StorageError::Open("locator is empty".to_string()));
        }

        if !locator.contains("://") {
            return Ok(Locator::Local(PathBuf::from(locator)));
        }

        let url = Url::parse(locator)
            .map_err(|e| StorageError::Open(format!("malformed locator {:?}: {}", locator, e)))?;

        match url.scheme() {
            "file" => {
                let path = url.to_file_path().map_err(|_| {
                    StorageError::Open(format!("{:?} is not a valid file URL", locator))
                })?;
                Ok(Locator::Local(path))
            }
            "s3" => {
                let bucket = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| {
                        StorageError::Open(format!("{:?} does not name a bucket", locator))
                    })?
                    .to_string();

                let mut region = None;
                let mut endpoint = None;
                for (name, value) in url.query_pairs() {
                    match name.as_ref() {
                        "region" => region = Some(value.into_owned()),
                        "endpoint" => endpoint = Some(value.into_owned()),
                        other => {
                            return Err(StorageError::Open(format!(
                                "unsupported s3 locator parameter {:?}",
                                other
                            )))
                        }
                    }
                }

                Ok(Locator::S3 {
                    bucket,
                    root: url_root(&url)?,
                    region,
                    endpoint,
                })
            }
            "mem" => Ok(Locator::Memory {
                name: url.host_str().unwrap_or_default().to_string(),
                root: url_root(&url)?,
            }),
            other => Err(StorageError::Open(format!(
                "unsupported locator scheme {:?}",
                other
            ))),
        }
    }

    pub fn kind(&self) -> BucketKind {
        match self {
            Locator::Local(_) => BucketKind::Local,
            Locator::S3 { .. } | Locator::Memory { .. } => BucketKind::Cloud,
        }
    }
}

/// Key root taken from the URL path, without surrounding slashes.
fn url_root(url: &Url) -> StorageResult<Option<String>> {
    let decoded = urlencoding::decode(url.path())
        .map_err(|e| StorageError::Open(format!("locator path is not UTF-8: {}", e)))?;
    let root = decoded.trim_matches('/');
    if root.is_empty() {
        return Ok(None);
    }
    validate_prefix(root).map_err(|e| StorageError::Open(e.to_string()))?;
    Ok(Some(root.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths_are_local() {
        assert_eq!(
            Locator::parse("/var/lib/app").unwrap(),
            Locator::Local(PathBuf::from("/var/lib/app"))
        );
        assert_eq!(
            Locator::parse("relative/dir").unwrap(),
            Locator::Local(PathBuf::from("relative/dir"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_urls_are_local() {
        assert_eq!(
            Locator::parse("file:///srv/data").unwrap(),
            Locator::Local(PathBuf::from("/srv/data"))
        );
    }

    #[test]
    fn s3_urls_carry_root_and_params() {
        let locator =
            Locator::parse("s3://media/gitea/data?region=eu-west-1&endpoint=http://minio:9000")
                .unwrap();
        assert_eq!(
            locator,
            Locator::S3 {
                bucket: "media".to_string(),
                root: Some("gitea/data".to_string()),
                region: Some("eu-west-1".to_string()),
                endpoint: Some("http://minio:9000".to_string()),
            }
        );
        assert_eq!(locator.kind(), BucketKind::Cloud);
    }

    #[test]
    fn s3_without_bucket_is_rejected() {
        assert!(matches!(
            Locator::parse("s3:///path"),
            Err(StorageError::Open(_))
        ));
    }

    #[test]
    fn unknown_scheme_and_params_are_rejected() {
        assert!(matches!(
            Locator::parse("ftp://host/dir"),
            Err(StorageError::Open(_))
        ));
        assert!(matches!(
            Locator::parse("s3://media?acl=public"),
            Err(StorageError::Open(_))
        ));
    }

    #[test]
    fn mem_urls() {
        assert_eq!(
            Locator::parse("mem://scratch").unwrap(),
            Locator::Memory {
                name: "scratch".to_string(),
                root: None
            }
        );
        assert_eq!(
            Locator::parse("mem://scratch/a/b/").unwrap(),
            Locator::Memory {
                name: "scratch".to_string(),
                root: Some("a/b".to_string())
            }
        );
    }

    #[test]
    fn empty_locator_uses_configured_default() {
        let config = Config::default().with_default_bucket("mem://default");
        assert_eq!(
            Locator::resolve("", &config).unwrap(),
            Locator::Memory {
                name: "default".to_string(),
                root: None
            }
        );

        let result = Locator::resolve("", &Config::default());
        assert!(matches!(result, Err(StorageError::Open(_))));
    }
}
