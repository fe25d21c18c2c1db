//! Catsweep command-line interface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use catsweep_client::{
    load_proxy_file, CatalogEndpoint, HttpCatalog, IdentityConfig, IdentityRotator,
};
use catsweep_core::IdRange;
use catsweep_pipeline::{
    BatchIngestor, FetchPlan, FetchScheduler, IngestOptions, PgDocumentSink,
};
use catsweep_storage::{StagedSource, StagingWriter};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "catsweep")]
#[command(about = "Bulk catalog fetch and staged-file ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sweep a numeric id range from the remote catalog into staged JSON files
    Fetch(FetchArgs),
    /// Bulk-insert staged JSON files into the document store
    Ingest(IngestArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// First id of the sweep (inclusive)
    #[arg(long)]
    start: u64,

    /// End of the sweep (exclusive)
    #[arg(long)]
    end: u64,

    /// Catalog endpoint URL
    #[arg(long)]
    base_url: String,

    /// Request header carrying the record id
    #[arg(long, default_value = "store")]
    id_header: String,

    /// Extra static header, `name:value`; repeatable
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Staging directory for fetched records
    #[arg(long, default_value = "staged")]
    output: PathBuf,

    /// Simultaneous in-flight fetches
    #[arg(long, default_value_t = 50)]
    concurrency: usize,

    /// Ids dispatched per wave barrier
    #[arg(long, default_value_t = 1000)]
    wave_size: usize,

    /// Egress-descriptor file, one `host:port[:user:password]` per line
    #[arg(long)]
    proxy_file: Option<PathBuf>,

    /// Client-identity string; repeatable, built-in pool when omitted
    #[arg(long = "user-agent")]
    user_agents: Vec<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 20)]
    timeout_secs: u64,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Staged file or directory of staged files
    #[arg(long)]
    input: PathBuf,

    /// Document store connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Target table
    #[arg(long, default_value = "staged_records")]
    table: String,

    /// Records per bulk insert
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Destructively clear the target table before ingesting
    #[arg(long)]
    drop: bool,

    /// Rewrite parsable string timestamps to canonical RFC 3339 UTC
    #[arg(long)]
    normalize_timestamps: bool,

    /// Field inspected by timestamp normalization
    #[arg(long, default_value = "timestamp")]
    timestamp_field: String,

    /// Delete staged files once their batches are confirmed inserted
    #[arg(long)]
    delete_on_success: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Fetch(args) => fetch(args).await,
        Commands::Ingest(args) => ingest(args).await,
    }
}

async fn fetch(args: FetchArgs) -> Result<()> {
    let proxies = match &args.proxy_file {
        Some(path) => load_proxy_file(path)
            .with_context(|| format!("loading egress file {}", path.display()))?,
        None => Vec::new(),
    };
    let identities = IdentityRotator::new(IdentityConfig {
        user_agents: args.user_agents.clone(),
        proxies,
        timeout: Duration::from_secs(args.timeout_secs),
    })
    .context("building identity rotator")?;

    let mut endpoint = CatalogEndpoint::new(&args.base_url, &args.id_header);
    for header in &args.headers {
        let (name, value) = parse_header(header)?;
        endpoint = endpoint.with_header(name, value);
    }

    let scheduler = FetchScheduler::new(
        Arc::new(HttpCatalog::new(endpoint)),
        Arc::new(identities),
        Arc::new(StagingWriter::new(&args.output)),
    );
    let report = scheduler
        .run(FetchPlan {
            range: IdRange::new(args.start, args.end),
            concurrency: args.concurrency,
            wave_size: args.wave_size,
        })
        .await
        .context("running fetch sweep")?;

    println!(
        "fetch complete: run_id={} targets={} staged={} absent={} transient={} io_failures={} waves={}",
        report.run_id,
        report.targets,
        report.staged,
        report.absent,
        report.transient_failures,
        report.io_failures,
        report.waves
    );
    Ok(())
}

async fn ingest(args: IngestArgs) -> Result<()> {
    let paths = StagedSource::from_path(&args.input)
        .resolve()
        .with_context(|| format!("resolving staged input {}", args.input.display()))?;
    if paths.is_empty() {
        bail!("no staged files under {}", args.input.display());
    }

    let sink = PgDocumentSink::connect(&args.database_url, &args.table)
        .await
        .context("connecting to document store")?;
    let ingestor = BatchIngestor::new(
        Arc::new(sink),
        IngestOptions {
            batch_size: args.batch_size,
            drop_target_first: args.drop,
            normalize_timestamps: args.normalize_timestamps,
            timestamp_field: args.timestamp_field.clone(),
            delete_on_success: args.delete_on_success,
        },
    );
    let report = ingestor.run(&paths).await.context("running ingestion")?;

    println!(
        "ingest complete: files={}/{} inserted={} batches={} failed_batches={} deleted={} skipped={}",
        report.files_loaded,
        report.files_total,
        report.records_inserted,
        report.batches_flushed,
        report.batches_failed,
        report.files_deleted,
        report.files_skipped
    );
    Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("header {raw:?} is not name:value");
    };
    Ok((name.trim().to_string(), value.trim().to_string()))
}
