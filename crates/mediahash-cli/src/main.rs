use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mediahash_client::blockhash::DEFAULT_HASH_COMMAND;
use mediahash_client::commons::{DEFAULT_API_URL, DEFAULT_USER_AGENT};
use mediahash_client::loader::DEFAULT_LOADER_COMMAND;
use mediahash_client::{CommandHasher, CommandLoader, CommonsClient, ReqwestFetcher};
use mediahash_core::enqueue::PROGRESS_EVERY;
use mediahash_core::orchestrator::sweep_stale_claims;
use mediahash_core::traits::{MetadataProvider, WorkStore};
use mediahash_core::work::{Handler, NewWork, WorkStatus};
use mediahash_core::{
    ClaimConfig, ClaimProtocol, EnqueueRequest, ExportStage, FetchConfig, FetchStage, HashStage,
    MissingEntryPolicy, Orchestrator, OrchestratorConfig, Queue, RateLimit, TaskQueue,
    TaskStatus, TracingCycleReporter, TracingWorkerReporter, WorkerConfig, WorkerService,
    document_line, enqueue,
};
use mediahash_db::{Database, DatabaseConfig, TaskRepository, WorkRepository};

/// Name of the shared bucket every hash worker draws from.
const HASH_LIMITER: &str = "hash";

#[derive(Parser)]
#[command(name = "mediahash", version, about = "Distributed perceptual-hash pipeline for media catalogs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert identifiers (one per line) as idle works
    Seed {
        /// File to read; stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Provider integration owning the identifiers
        #[arg(long, default_value = "wmc")]
        handler: Handler,
    },

    /// Move idle works to queued and schedule metadata fetches
    Enqueue {
        /// Maximum number of works to move
        #[arg(short, long)]
        count: u64,

        #[arg(long, env = "MEDIAHASH_BATCH_SIZE", default_value_t = 50)]
        batch_size: usize,
    },

    /// Move done works to queued_export and schedule exports
    EnqueueExport {
        #[arg(short, long)]
        count: u64,

        #[arg(long, env = "MEDIAHASH_BATCH_SIZE", default_value_t = 50)]
        batch_size: usize,
    },

    /// Run a task worker until interrupted
    Worker {
        /// Queues to consume, comma separated
        #[arg(long, value_delimiter = ',', default_value = "apidata,hash,export")]
        queues: Vec<Queue>,

        #[arg(long, env = "MEDIAHASH_WORKER_ID")]
        worker_id: Option<String>,

        /// Seconds to wait when every queue is empty
        #[arg(long, env = "MEDIAHASH_POLL_INTERVAL", default_value_t = 5)]
        poll_interval: u64,

        /// Also run the self-restarting fetch loop in this process
        #[arg(long, default_value_t = false)]
        orchestrate: bool,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Run only the self-restarting fetch loop
    Orchestrate {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Release claims older than the given age
    Sweep {
        /// Claim age in seconds
        #[arg(long, default_value_t = 3600)]
        older_than: i64,

        /// Maximum works released per lane
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },

    /// Show work counts per status and pending tasks per queue
    Stats,

    /// Write export documents of done works as NDJSON
    Dump {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, default_value_t = 10_000)]
        count: usize,
    },
}

#[derive(Args, Clone)]
struct PipelineArgs {
    /// Metadata API endpoint
    #[arg(long, env = "MEDIAHASH_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    #[arg(long, env = "MEDIAHASH_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    user_agent: String,

    /// Perceptual hash command, invoked as `<command> <file>`
    #[arg(long, env = "BLOCKHASH_COMMAND", default_value = DEFAULT_HASH_COMMAND)]
    blockhash_command: String,

    /// Bulk loader command, fed export documents on stdin
    #[arg(long, env = "LOADER_COMMAND", default_value = DEFAULT_LOADER_COMMAND)]
    loader_command: String,

    /// Global hash rate across all workers, e.g. `5/s` or `300/m`
    #[arg(long, env = "HASH_RATE_LIMIT", default_value = "5/s")]
    hash_rate_limit: RateLimit,

    /// Works claimed per fetch batch (at most 50)
    #[arg(long, env = "MEDIAHASH_BATCH_SIZE", default_value_t = 50)]
    batch_size: usize,

    /// What to do with works the provider does not describe
    #[arg(long, value_enum, default_value_t = MissingEntry::LeaveClaimed)]
    missing_entry: MissingEntry,

    /// Release fetch and export claims older than this many seconds
    #[arg(long, env = "MEDIAHASH_STALE_AFTER")]
    stale_after: Option<i64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum MissingEntry {
    LeaveClaimed,
    MarkError,
}

impl From<MissingEntry> for MissingEntryPolicy {
    fn from(value: MissingEntry) -> Self {
        match value {
            MissingEntry::LeaveClaimed => MissingEntryPolicy::LeaveClaimed,
            MissingEntry::MarkError => MissingEntryPolicy::MarkError,
        }
    }
}

type Fetch = FetchStage<WorkRepository, CommonsClient, TaskRepository>;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mediahash=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db = connect_db().await?;

    match cli.command {
        Commands::Seed { file, handler } => cmd_seed(&db, file.as_deref(), handler).await?,
        Commands::Enqueue { count, batch_size } => {
            cmd_enqueue(&db, EnqueueRequest::fetch(count).with_batch_size(batch_size)).await?
        }
        Commands::EnqueueExport { count, batch_size } => {
            cmd_enqueue(&db, EnqueueRequest::export(count).with_batch_size(batch_size)).await?
        }
        Commands::Worker {
            queues,
            worker_id,
            poll_interval,
            orchestrate,
            pipeline,
        } => {
            let mut config = WorkerConfig::default()
                .with_queues(queues)
                .with_poll_interval(Duration::from_secs(poll_interval.max(1)));
            if let Some(id) = worker_id {
                config = config.with_worker_id(id);
            }
            cmd_worker(&db, &pipeline, config, orchestrate).await?;
        }
        Commands::Orchestrate { pipeline } => cmd_orchestrate(&db, &pipeline).await?,
        Commands::Sweep { older_than, limit } => cmd_sweep(&db, older_than, limit).await?,
        Commands::Stats => cmd_stats(&db).await?,
        Commands::Dump { output, count } => cmd_dump(&db, &output, count).await?,
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply pending migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to migrate database")?;
    Ok(db)
}

/// Cancel the returned token on Ctrl+C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        trigger.cancel();
    });
    token
}

fn fetch_stage(db: &Database, pipeline: &PipelineArgs) -> Result<Fetch> {
    let provider = CommonsClient::with_api_url(&pipeline.api_url, &pipeline.user_agent)
        .context("Failed to create metadata client")?;
    let claims = ClaimProtocol::new(
        db.work_repo(),
        ClaimConfig::default().with_batch_size(pipeline.batch_size.min(provider.batch_limit())),
    );
    let config = FetchConfig::default().with_missing_entry(pipeline.missing_entry.into());
    Ok(FetchStage::new(claims, provider, db.task_repo(), config))
}

fn orchestrator_config(pipeline: &PipelineArgs) -> OrchestratorConfig {
    let config = OrchestratorConfig::default();
    match pipeline.stale_after {
        Some(secs) => config.with_stale_claim_timeout(TimeDelta::seconds(secs.max(1))),
        None => config,
    }
}

async fn cmd_seed(db: &Database, file: Option<&Path>, handler: Handler) -> Result<()> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match file {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let repo = db.work_repo();
    let mut lines = reader.lines();
    let (mut read, mut inserted) = (0u64, 0u64);

    while let Some(line) = lines.next_line().await.context("Failed to read identifiers")? {
        let url = line.trim();
        if url.is_empty() {
            continue;
        }
        read += 1;
        if repo.insert_if_absent(&NewWork::new(handler, url)).await? {
            inserted += 1;
        }
        if read % PROGRESS_EVERY == 0 {
            tracing::info!(%read, %inserted, "Seeding");
        }
    }

    println!("Seeded {inserted} works ({} already present)", read - inserted);
    Ok(())
}

async fn cmd_enqueue(db: &Database, request: EnqueueRequest) -> Result<()> {
    let report = enqueue(&db.work_repo(), &db.task_repo(), &request, |moved| {
        tracing::info!(%moved, to = %request.to, "Enqueued");
    })
    .await?;

    println!(
        "Moved {} works from {} to {} in {} tasks",
        report.moved, request.from, request.to, report.tasks
    );
    if report.exhausted {
        println!("No more {} works", request.from);
    }
    Ok(())
}

async fn cmd_worker(
    db: &Database,
    pipeline: &PipelineArgs,
    config: WorkerConfig,
    orchestrate: bool,
) -> Result<()> {
    let fetch = fetch_stage(db, pipeline)?;
    let limiter = db.rate_limiter(HASH_LIMITER, pipeline.hash_rate_limit).await?;
    let fetcher = ReqwestFetcher::with_timeout(&pipeline.user_agent, Duration::from_secs(30))
        .context("Failed to create artifact downloader")?;
    let hasher = CommandHasher::new(&pipeline.blockhash_command)?;
    let loader = CommandLoader::new(&pipeline.loader_command)?;

    let hash = HashStage::new(db.work_repo(), limiter, fetcher, hasher);
    let export = ExportStage::new(fetch.claims().clone(), loader);
    let orchestrator = orchestrate.then(|| Orchestrator::new(fetch.clone(), orchestrator_config(pipeline)));
    let worker = WorkerService::new(db.task_repo(), fetch, hash, export, config);

    let cancel = shutdown_token();
    let orchestrated = async {
        match &orchestrator {
            Some(orchestrator) => orchestrator
                .run(cancel.clone(), &TracingCycleReporter)
                .await
                .map(Some),
            None => Ok(None),
        }
    };
    let (worked, orchestrated) = tokio::join!(
        worker.run(cancel.clone(), &TracingWorkerReporter),
        orchestrated
    );
    worked?;
    if let Some(cycles) = orchestrated? {
        tracing::info!(%cycles, "Fetch loop finished");
    }
    Ok(())
}

async fn cmd_orchestrate(db: &Database, pipeline: &PipelineArgs) -> Result<()> {
    let orchestrator = Orchestrator::new(fetch_stage(db, pipeline)?, orchestrator_config(pipeline));
    let cycles = orchestrator
        .run(shutdown_token(), &TracingCycleReporter)
        .await?;
    println!("Processed {cycles} batches");
    Ok(())
}

async fn cmd_sweep(db: &Database, older_than: i64, limit: usize) -> Result<()> {
    let claims = ClaimProtocol::new(db.work_repo(), ClaimConfig::default());
    let cutoff = Utc::now() - TimeDelta::seconds(older_than.max(0));
    let released = sweep_stale_claims(&claims, cutoff, limit).await?;
    println!("Released {released} stale claims");
    Ok(())
}

async fn cmd_stats(db: &Database) -> Result<()> {
    let works = db.work_repo();
    println!("Works:");
    for status in WorkStatus::ALL {
        println!("  {:<18} {}", status.as_str(), works.count_by_status(status).await?);
    }

    let tasks = db.task_repo();
    println!("Tasks:");
    for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Failed] {
        println!("  {:<18} {}", status.as_str(), tasks.count_by_status(status).await?);
    }
    for (queue, pending) in tasks.pending_by_queue().await? {
        println!("  pending/{:<10} {}", queue.as_str(), pending);
    }
    Ok(())
}

async fn cmd_dump(db: &Database, output: &Path, count: usize) -> Result<()> {
    let works = db.work_repo().list_by_status(WorkStatus::Done, count).await?;
    let file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);

    let mut written = 0usize;
    for work in &works {
        match document_line(work) {
            Ok((_, line)) => {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                written += 1;
            }
            Err(e) => tracing::warn!(work_id = work.id, error = %e, "Skipping work"),
        }
    }
    writer.flush().await?;

    println!("Wrote {written} documents to {}", output.display());
    Ok(())
}
