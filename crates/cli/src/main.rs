mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chatvault_core::{EgressProgress, ObjectId, ObjectMeta, ScanScope, progress_channel};
use chatvault_crypto::{ChunkCodec, CodecConfig, SecretString};
use chatvault_engine::{Downloader, HealthScanner, IngestService};
use chatvault_platform::{DiscordClientFactory, HttpCdnClient};
use chatvault_pool::ConnectionPool;
use chatvault_state_memory::MemoryMetadataStore;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ChatvaultConfig;

/// Environment variable holding the encryption password.
const PASSWORD_ENV: &str = "CHATVAULT_PASSWORD";

/// Encrypted object storage on top of chat attachments.
#[derive(Parser, Debug)]
#[command(name = "chatvault", about = "Store files as encrypted chat attachments")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "chatvault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a file and print its object record.
    Put {
        path: PathBuf,
        /// Stored name; defaults to the file name.
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long, default_value = "chatvault")]
        owner: String,
        /// Plaintext bytes per chunk.
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Store without encryption even when a password is set.
        #[arg(long)]
        plain: bool,
    },
    /// Download an object into a file.
    Get { object_id: String, output: PathBuf },
    /// Delete an object and the messages that carry it.
    Rm { object_id: String },
    /// Probe chunk URLs and record their health.
    Scan {
        #[arg(long, conflicts_with_all = ["folder", "sample"])]
        object: Option<String>,
        #[arg(long, conflicts_with = "sample")]
        folder: Option<String>,
        /// Percentage of all chunks to probe.
        #[arg(long)]
        sample: Option<f64>,
    },
    /// Sample chunks and explain why they are unreachable.
    Diagnose { object_id: Option<String> },
}

struct Context {
    pool: ConnectionPool,
    store: Arc<MemoryMetadataStore>,
    codec: Option<ChunkCodec>,
    config: ChatvaultConfig,
    cdn: Arc<HttpCdnClient>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ChatvaultConfig::load(&cli.config)?;

    // RUST_LOG wins over the configured filter.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.telemetry.filter)),
        )
        .with_writer(std::io::stderr)
        .init();
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "config file not found, using defaults");
    }

    if config.bots.is_empty() {
        return Err("no [[bots]] configured".into());
    }

    let store = Arc::new(MemoryMetadataStore::load(&config.store.snapshot).await?);
    let codec = std::env::var(PASSWORD_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(|p| ChunkCodec::new(SecretString::new(p), CodecConfig::default()));
    if codec.is_none() {
        info!("{PASSWORD_ENV} not set, objects are stored unencrypted");
    }

    let cdn = Arc::new(HttpCdnClient::new(
        Duration::from_secs(config.platform.request_timeout_secs),
        config.platform.default_proxy.as_deref(),
    )?);
    let factory = Arc::new(DiscordClientFactory::new(config.platform.clone()));
    let pool = ConnectionPool::init(factory, config.bots.clone(), config.pool_config()).await?;
    info!(connections = pool.status().len(), "connection pool ready");

    let ctx = Context {
        pool,
        store,
        codec,
        config,
        cdn,
    };
    let outcome = run(cli.command, &ctx).await;

    ctx.pool.shutdown();
    // Rollbacks change metadata too, so the snapshot is written on failure as well.
    ctx.store.save(&ctx.config.store.snapshot).await?;
    outcome
}

async fn run(command: Commands, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Put {
            path,
            name,
            folder,
            owner,
            chunk_size,
            plain,
        } => put(ctx, &path, name, folder, owner, chunk_size, plain).await,
        Commands::Get { object_id, output } => get(ctx, &ObjectId::new(object_id), &output).await,
        Commands::Rm { object_id } => {
            let ingest = IngestService::new(
                ctx.pool.clone(),
                ctx.store.clone(),
                ctx.codec.clone(),
                ctx.config.ingest.clone(),
            );
            let report = ingest.delete_object(&ObjectId::new(object_id)).await?;
            print_json(&report)
        }
        Commands::Scan { object, folder, sample } => {
            let scope = match (object, folder, sample) {
                (Some(object_id), _, _) => ScanScope::Object {
                    object_id: ObjectId::new(object_id),
                },
                (None, Some(folder), _) => ScanScope::Folder { folder },
                (None, None, Some(percent)) => ScanScope::Sample { percent },
                (None, None, None) => ScanScope::All,
            };
            scan(ctx, scope).await
        }
        Commands::Diagnose { object_id } => {
            let object_id = object_id.map(ObjectId::new);
            let report = scanner(ctx).diagnose(object_id.as_ref()).await?;
            print_json(&report)
        }
    }
}

async fn put(
    ctx: &Context,
    path: &Path,
    name: Option<String>,
    folder: Option<String>,
    owner: String,
    chunk_size: Option<u64>,
    plain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let name = name
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .ok_or("cannot derive an object name from the path")?;
    let mut meta = ObjectMeta::new(name, size, owner);
    if let Some(folder) = folder {
        meta = meta.with_folder(folder);
    }
    if let Some(chunk_size) = chunk_size {
        meta = meta.with_chunk_size(chunk_size);
    }

    let config = ctx.config.ingest.clone().with_encryption(!plain);
    let ingest = IngestService::new(ctx.pool.clone(), ctx.store.clone(), ctx.codec.clone(), config);
    let (progress, mut rx) = progress_channel();
    let upload = ingest.put_with_progress(meta, file, progress);
    tokio::pin!(upload);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let mut object_id: Option<ObjectId> = None;
    let mut interrupted = false;
    let record = loop {
        tokio::select! {
            result = &mut upload => break result?,
            Some(update) = rx.recv() => {
                info!(
                    object_id = %update.object_id,
                    stage = ?update.stage,
                    done = update.chunks_done,
                    total = update.chunks_total,
                    "upload progress"
                );
                object_id.get_or_insert(update.object_id);
            }
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                warn!("interrupted, rolling back upload");
                if let Some(id) = &object_id {
                    ingest.cancel(id).await?;
                }
            }
        }
    };
    print_json(&record)
}

async fn get(ctx: &Context, object_id: &ObjectId, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let downloader = Downloader::new(
        ctx.pool.clone(),
        ctx.store.clone(),
        ctx.cdn.clone(),
        ctx.codec.clone(),
        ctx.config.egress.clone(),
    );
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling download");
            on_interrupt.cancel();
        }
    });

    let (progress, mut rx) = progress_channel::<EgressProgress>();
    let reporter = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            info!(
                chunks = update.chunks_done,
                total = update.chunks_total,
                bytes = update.bytes_written,
                "download progress"
            );
        }
    });

    let mut file = tokio::fs::File::create(output).await?;
    let result = downloader.download(object_id, &mut file, &cancel, &progress).await;
    watcher.abort();
    drop(progress);
    let _ = reporter.await;

    match result {
        Ok(report) => {
            if report.degraded {
                warn!(object_id = %object_id, "some chunks were read from cached URLs");
            }
            print_json(&report)
        }
        Err(e) => {
            drop(file);
            if let Err(remove) = tokio::fs::remove_file(output).await {
                warn!(path = %output.display(), error = %remove, "could not remove partial output");
            }
            Err(e.into())
        }
    }
}

async fn scan(ctx: &Context, scope: ScanScope) -> Result<(), Box<dyn std::error::Error>> {
    let scanner = scanner(ctx);
    let (progress, mut rx) = progress_channel();
    let scan_id = scanner.start_scan(scope, progress).await?;
    info!(scan_id = %scan_id, "scan started");

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut interrupted = false;
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => info!(
                    checked = update.checked,
                    total = update.total,
                    unhealthy = update.unhealthy,
                    errors = update.errors,
                    "scan progress"
                ),
                None => break,
            },
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                warn!(scan_id = %scan_id, "interrupted, cancelling scan");
                scanner.cancel_scan(&scan_id);
            }
        }
    }

    let record = scanner.get_scan(&scan_id).await?;
    print_json(&record)
}

fn scanner(ctx: &Context) -> HealthScanner {
    HealthScanner::new(
        ctx.pool.clone(),
        ctx.store.clone(),
        ctx.cdn.clone(),
        ctx.config.health.clone(),
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
