use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shiftstore_core::Config;
use shiftstore_storage::ObjectRecord;

/// Initialize tracing for CLI binaries.
///
/// `RUST_LOG` selects the filter (default `info`); `LOG_FORMAT=json` switches
/// to one JSON object per line.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if wants_json(std::env::var("LOG_FORMAT").ok().as_deref()) {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn wants_json(log_format: Option<&str>) -> bool {
    log_format.is_some_and(|value| value.trim().eq_ignore_ascii_case("json"))
}

/// Which buckets a `storage-migrate` invocation copies between
#[derive(Debug)]
pub struct MigrationPlan {
    /// Config with the target bucket installed as the default
    pub config: Config,
    pub source: String,
    pub destination: String,
}

/// Resolve the direction of a migration.
///
/// The work directory is one side and the bucket named by `--bucket` (or the
/// configured default) is the other. `to_local` copies from the bucket back
/// into the work directory.
pub fn plan_migration(
    config: Config,
    bucket: Option<String>,
    to_local: bool,
) -> anyhow::Result<MigrationPlan> {
    let bucket = bucket
        .or_else(|| config.default_bucket.clone())
        .filter(|b| !b.trim().is_empty());
    let Some(bucket) = bucket else {
        bail!("missing bucket");
    };

    let config = config.with_default_bucket(bucket);
    let work = config.app_work_path.to_string_lossy().into_owned();
    let (source, destination) = if to_local {
        (String::new(), work)
    } else {
        (work, String::new())
    };

    Ok(MigrationPlan {
        config,
        source,
        destination,
    })
}

/// One line of `ls` output
#[derive(Debug, Serialize)]
pub struct RecordRow<'a> {
    pub key: &'a str,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl<'a> From<&'a ObjectRecord> for RecordRow<'a> {
    fn from(record: &'a ObjectRecord) -> Self {
        Self {
            key: &record.key,
            size: record.size,
            last_modified: record.last_modified,
        }
    }
}

impl RecordRow<'_> {
    pub fn to_tsv(&self) -> String {
        format!(
            "{}\t{}\t{}",
            self.key,
            self.size,
            self.last_modified.to_rfc3339()
        )
    }
}
