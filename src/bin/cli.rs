//! bucketsync CLI
//!
//! Sync, list and clear directories in S3-compatible object storage.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bucketsync::storage::{BackendConfig, S3StorageClient};
use bucketsync::sync::{SyncEngine, SyncRequest};
use bucketsync::types::{size_text, Scope, SyncConfig, SyncSummary};

#[derive(Parser)]
#[command(name = "bucketsync")]
#[command(about = "Directory sync for S3-compatible object storage")]
#[command(version)]
struct Cli {
    /// Backend description (JSON); defaults to AWS S3 with ambient credentials
    #[arg(long, env = "BUCKETSYNC_BACKEND_CONFIG")]
    backend_config: Option<String>,

    /// Tuning file (JSON) for concurrency, paging and retries
    #[arg(long, env = "BUCKETSYNC_SYNC_CONFIG")]
    sync_config: Option<String>,

    /// Concurrent copy/delete workers
    #[arg(short, long, env = "BUCKETSYNC_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Attempts per operation before it is reported as failed
    #[arg(long, env = "BUCKETSYNC_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Emit logs as JSON lines
    #[arg(long, env = "BUCKETSYNC_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a directory from one bucket to another
    Sync {
        /// Source bucket
        source: String,
        /// Destination bucket
        destination: String,
        /// Path below the root directory (empty for the whole root)
        #[arg(default_value = "")]
        subpath: String,
        /// Top-level directory both sides live under
        #[arg(long, default_value = "public")]
        root: String,
        /// Remove destination objects missing from the source
        #[arg(short, long)]
        delete: bool,
        /// Print the plan without copying or deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// List objects under a prefix
    Ls {
        /// Key prefix
        #[arg(default_value = "")]
        prefix: String,
        /// Bucket (defaults to the backend's bucket)
        #[arg(short, long)]
        bucket: Option<String>,
    },
    /// Delete every object under a prefix
    Rm {
        /// Key prefix
        prefix: String,
        /// Bucket (defaults to the backend's bucket)
        #[arg(short, long)]
        bucket: Option<String>,
        /// Confirm the removal
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let backend = match &cli.backend_config {
        Some(path) => BackendConfig::load(path)
            .with_context(|| format!("loading backend config {}", path))?,
        None => BackendConfig::default(),
    };
    let config = load_sync_config(&cli)?;

    let client = S3StorageClient::from_config(&backend)
        .await
        .context("creating storage client")?;
    let engine = SyncEngine::new(Arc::new(client), config)?
        .with_copy_options(backend.copy_options());

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight operations");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Sync {
            source,
            destination,
            subpath,
            root,
            delete,
            dry_run,
        } => {
            let prefix = join_path(&root, &subpath);
            let request = SyncRequest::new(
                Scope::new(source, &prefix)?,
                Scope::new(destination, &prefix)?,
                delete,
            )?;

            if dry_run {
                let plan = engine.plan(&request).await?;
                for record in &plan.to_copy {
                    println!("copy    {}", record.relative_key);
                }
                for record in &plan.to_delete {
                    println!("delete  {}", record.relative_key);
                }
                println!(
                    "Would add {} files, {}",
                    plan.to_copy.len(),
                    size_text(plan.copy_bytes())
                );
                println!(
                    "Would delete {} files, {}",
                    plan.to_delete.len(),
                    size_text(plan.delete_bytes())
                );
                return Ok(());
            }

            let summary = engine
                .sync(&request)
                .await
                .with_context(|| format!("sync {} -> {}", request.source, request.destination))?;
            finish(&summary);
        }

        Commands::Ls { prefix, bucket } => {
            let scope = Scope::new(resolve_bucket(bucket, &backend)?, &prefix)?;
            let snapshot = engine.list(&scope).await?;

            for record in snapshot.iter() {
                let modified = record
                    .last_modified
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {}  {}",
                    scope.full_key(&record.relative_key),
                    record.size,
                    modified
                );
            }
            println!(
                "Total: {} objects, {}",
                snapshot.len(),
                size_text(snapshot.total_bytes())
            );
        }

        Commands::Rm {
            prefix,
            bucket,
            yes,
        } => {
            let scope = Scope::new(resolve_bucket(bucket, &backend)?, &prefix)?;
            if !yes {
                bail!("refusing to delete everything under {} without --yes", scope);
            }

            let summary = engine.remove_all(&scope).await?;
            finish(&summary);
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(filter)
            .init();
    }
}

fn load_sync_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.sync_config {
        Some(path) => {
            let expanded = shellexpand::tilde(path).to_string();
            let content = std::fs::read_to_string(&expanded)
                .with_context(|| format!("reading sync config {}", expanded))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing sync config {}", expanded))?
        }
        None => SyncConfig::default(),
    };

    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }
    Ok(config)
}

fn resolve_bucket(bucket: Option<String>, backend: &BackendConfig) -> anyhow::Result<String> {
    match bucket.or_else(|| backend.default_bucket().map(str::to_string)) {
        Some(bucket) => Ok(bucket),
        None => bail!("no bucket given and the backend config does not name one"),
    }
}

fn join_path(root: &str, subpath: &str) -> String {
    let root = root.trim_matches('/');
    let subpath = subpath.trim_matches('/');
    match (root.is_empty(), subpath.is_empty()) {
        (true, _) => subpath.to_string(),
        (false, true) => root.to_string(),
        (false, false) => format!("{}/{}", root, subpath),
    }
}

/// Print the summary and exit non-zero if anything failed
fn finish(summary: &SyncSummary) {
    println!("{}", summary);
    if !summary.is_clean() {
        std::process::exit(1);
    }
}
