//! Shiftstore CLI: move stored objects between the work directory and a bucket.
//!
//! Configuration comes from the environment (and `.env`); see `Config`.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::TryStreamExt;
use shiftstore_cli::{init_tracing, plan_migration, RecordRow};
use shiftstore_core::Config;
use shiftstore_storage::{migrate_prefixes, open_bucket, CancellationToken};

#[derive(Parser)]
#[command(name = "shiftstore", about = "Migrate stored objects between buckets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy the upload directories from the work directory into a bucket
    StorageMigrate {
        /// Target bucket locator (defaults to BUCKET_URL)
        #[arg(long)]
        bucket: Option<String>,
        /// Copy from the bucket back into the work directory instead
        #[arg(long)]
        local: bool,
        /// Objects copied at once (defaults to MIGRATION_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Cancel the run after this many seconds
        #[arg(long, value_name = "SECONDS")]
        timeout_secs: Option<u64>,
    },
    /// List the objects of a bucket
    Ls {
        /// Bucket locator; empty opens BUCKET_URL
        #[arg(default_value = "")]
        locator: String,
        /// Only list keys starting with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::StorageMigrate {
            bucket,
            local,
            concurrency,
            timeout_secs,
        } => {
            let concurrency = concurrency.unwrap_or(config.migration_concurrency);
            storage_migrate(config, bucket, local, concurrency, timeout_secs).await
        }
        Commands::Ls {
            locator,
            prefix,
            format,
        } => list(&config, &locator, &prefix, format).await,
    }
}

async fn storage_migrate(
    config: Config,
    bucket: Option<String>,
    to_local: bool,
    concurrency: usize,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let plan = plan_migration(config, bucket, to_local)?;

    let source = open_bucket(&plan.config, &plan.source)
        .await
        .with_context(|| format!("Failed to open source bucket {:?}", plan.source))?;
    let destination = open_bucket(&plan.config, &plan.destination)
        .await
        .with_context(|| format!("Failed to open destination bucket {:?}", plan.destination))?;

    tracing::info!(
        source = %source.location(),
        destination = %destination.location(),
        concurrency,
        "Starting storage migration"
    );

    let ctx = CancellationToken::new();
    let _stop_watcher = ctx.clone().drop_guard();
    spawn_cancel_watcher(ctx.clone(), timeout_secs.map(Duration::from_secs));

    let prefixes = plan.config.upload_prefixes();
    let result = migrate_prefixes(
        source.as_ref(),
        destination.as_ref(),
        &prefixes,
        concurrency,
        &ctx,
    )
    .await;

    if let Err(e) = source.close().await {
        tracing::warn!(error = %e, "Failed to close source bucket");
    }
    if let Err(e) = destination.close().await {
        tracing::warn!(error = %e, "Failed to close destination bucket");
    }

    let reports = result?;
    for report in &reports {
        println!(
            "{}\tcopied={}\tskipped={}\tbytes={}",
            report.prefix, report.copied, report.skipped, report.bytes
        );
    }
    Ok(())
}

/// Cancel `ctx` on Ctrl-C or once `timeout` elapses; exits when `ctx` is
/// cancelled by anyone else.
fn spawn_cancel_watcher(ctx: CancellationToken, timeout: Option<Duration>) {
    tokio::spawn(async move {
        let expired = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ctx.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                    return;
                }
                tracing::warn!("Interrupted, cancelling migration");
            }
            _ = expired => {
                tracing::warn!(timeout_secs = timeout.map(|t| t.as_secs()), "Timed out, cancelling migration");
            }
        }
        ctx.cancel();
    });
}

async fn list(config: &Config, locator: &str, prefix: &str, format: Format) -> anyhow::Result<()> {
    let bucket = open_bucket(config, locator)
        .await
        .with_context(|| format!("Failed to open bucket {:?}", locator))?;

    let result = bucket
        .list(prefix)
        .try_for_each(|record| {
            let row = RecordRow::from(&record);
            let line = match format {
                Format::Text => Ok(row.to_tsv()),
                Format::Json => serde_json::to_string(&row),
            };
            futures::future::ready(match line {
                Ok(line) => {
                    println!("{}", line);
                    Ok(())
                }
                Err(e) => Err(shiftstore_storage::StorageError::ListFailed {
                    prefix: prefix.to_string(),
                    message: format!("Serialize record: {}", e),
                }),
            })
        })
        .await;

    bucket.close().await.context("Failed to close bucket")?;
    result.with_context(|| format!("Failed to list {}", bucket.location()))
}
