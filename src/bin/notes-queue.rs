//! notes-queue CLI: run the worker, and the producer-side helpers.

use chrono::Utc;
use clap::{Parser, Subcommand};
use notes_queue::codec;
use notes_queue::config::Config;
use notes_queue::config::secrets::{key_bytes, mask};
use notes_queue::document::gist::GistStore;
use notes_queue::document::{DocumentStore, MemoryDocumentStore};
use notes_queue::engine::{SystemClock, Worker};
use notes_queue::executor::osascript::OsascriptExecutor;
use notes_queue::executor::{DryRunExecutor, Executor};
use notes_queue::gate::SecurityGate;
use notes_queue::model::NewJob;
use notes_queue::sink::{ResultSink, RetryPolicy, append_lines};
use notes_queue::storage::IdempotencyStore;
use notes_queue::telemetry::{TelemetryConfig, init_telemetry};
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "notes-queue", about = "Signed job queue worker for Apple Notes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the queue until interrupted
    Run,
    /// Run a single poll cycle and exit
    Once {
        /// Read the queue from a local file instead of the gist; results
        /// are printed instead of appended
        #[arg(long)]
        queue_file: Option<PathBuf>,
        /// Do not create notes and do not persist job ids
        #[arg(long)]
        dry_run: bool,
    },
    /// Sign a job object read from stdin and print the signed line
    Sign,
    /// Build, sign and append a note-creation job to the queue
    Enqueue {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long)]
        account: Option<String>,
        /// Set confirm=true on the job
        #[arg(long)]
        confirm: bool,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Explicit job id (default: random UUID)
        #[arg(long)]
        job_id: Option<String>,
    },
    /// List recently processed job ids
    Processed {
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Results document operations
    Results {
        #[command(subcommand)]
        action: ResultsAction,
    },
}

#[derive(Subcommand)]
enum ResultsAction {
    /// Replace the results document with empty content
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run => cmd_run(config).await,
        Command::Once {
            queue_file,
            dry_run,
        } => cmd_once(config, queue_file, dry_run).await,
        Command::Sign => cmd_sign(&config),
        Command::Enqueue {
            title,
            body,
            folder,
            account,
            confirm,
            tags,
            job_id,
        } => {
            let mut job = NewJob::create_note(title, body);
            if let Some(id) = job_id {
                job = job.job_id(id);
            }
            if let Some(folder) = folder {
                job = job.folder(folder);
            }
            if let Some(account) = account {
                job = job.account(account);
            }
            if confirm {
                job = job.confirm(true);
            }
            if !tags.is_empty() {
                job = job.tags(tags);
            }
            cmd_enqueue(&config, job).await
        }
        Command::Processed { limit } => cmd_processed(&config, limit),
        Command::Results {
            action: ResultsAction::Clear,
        } => {
            let store = gist_store(&config)?;
            ResultSink::new(store, config.results_document.clone())
                .clear()
                .await?;
            println!("Cleared {}", config.results_document);
            Ok(())
        }
    }
}

fn gist_store(config: &Config) -> anyhow::Result<Arc<dyn DocumentStore>> {
    let (gist_id, token) = config.gist_credentials()?;
    Ok(Arc::new(GistStore::new(gist_id, token.clone())?))
}

fn build_worker(
    config: &Config,
    documents: Arc<dyn DocumentStore>,
    store: IdempotencyStore,
    executor: Arc<dyn Executor>,
) -> Worker {
    let gate = SecurityGate::new(config.hmac_secret.clone(), config.gate_config());
    Worker::new(
        config.worker_config(),
        documents,
        gate,
        store,
        executor,
        Arc::new(SystemClock),
    )
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::new(
        "notes-queue",
        config.otel_endpoint.clone(),
    ))?;

    let documents = gist_store(&config)?;
    let store = IdempotencyStore::open(&config.db_path, config.store_capacity)?;
    info!(
        gist = %mask(config.gist_id.as_deref().unwrap_or_default()),
        db = %config.db_path.display(),
        allowed_folders = config.allowed_folders.len(),
        require_confirm = config.require_confirm,
        "starting worker"
    );

    let mut worker = build_worker(&config, documents, store, Arc::new(OsascriptExecutor::new()));

    let handle = worker.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_once(
    config: Config,
    queue_file: Option<PathBuf>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::new(
        "notes-queue",
        config.otel_endpoint.clone(),
    ))?;

    let local = match &queue_file {
        Some(path) => {
            let memory = MemoryDocumentStore::new();
            memory.insert(&config.queue_document, std::fs::read_to_string(path)?)?;
            Some(memory)
        }
        None => None,
    };
    let documents: Arc<dyn DocumentStore> = match &local {
        Some(memory) => Arc::new(memory.clone()),
        None => gist_store(&config)?,
    };

    let store = if dry_run {
        IdempotencyStore::in_memory(config.store_capacity)?
    } else {
        IdempotencyStore::open(&config.db_path, config.store_capacity)?
    };
    let executor: Arc<dyn Executor> = if dry_run {
        Arc::new(DryRunExecutor)
    } else {
        Arc::new(OsascriptExecutor::new())
    };

    let mut worker = build_worker(&config, documents, store, executor);
    let report = worker.run_cycle().await?;

    if local.is_some() {
        for record in &report.results {
            println!("{}", record.to_line()?);
        }
    }
    eprintln!(
        "{} job(s) read, {} result(s), {} already answered, {} unparsable, {} pending",
        report.jobs_read,
        report.results.len(),
        report.already_accounted,
        report.unparsable,
        report.pending
    );
    Ok(())
}

fn cmd_sign(config: &Config) -> anyhow::Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let value: serde_json::Value = serde_json::from_str(input.trim())?;
    let serde_json::Value::Object(mut job) = value else {
        anyhow::bail!("job must be a JSON object");
    };
    job.entry("job_id")
        .or_insert_with(|| uuid::Uuid::new_v4().to_string().into());
    job.entry("created_at").or_insert_with(|| {
        Utc::now()
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
            .into()
    });

    codec::sign_job(&mut job, key_bytes(&config.hmac_secret))?;
    println!("{}", serde_json::to_string(&job)?);
    Ok(())
}

async fn cmd_enqueue(config: &Config, job: NewJob) -> anyhow::Result<()> {
    let serde_json::Value::Object(mut wire) = job.to_value(Utc::now())? else {
        anyhow::bail!("job did not render as an object");
    };
    codec::sign_job(&mut wire, key_bytes(&config.hmac_secret))?;
    let line = serde_json::to_string(&wire)?;

    let store = gist_store(config)?;
    append_lines(
        store.as_ref(),
        &config.queue_document,
        &[line],
        &RetryPolicy::default(),
    )
    .await?;

    let job_id = wire
        .get("job_id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    println!("Enqueued {job_id}");
    Ok(())
}

fn cmd_processed(config: &Config, limit: usize) -> anyhow::Result<()> {
    let store = IdempotencyStore::open(&config.db_path, config.store_capacity)?;
    let records = store.list_recent(limit)?;

    if records.is_empty() {
        println!("No processed jobs.");
        return Ok(());
    }

    println!(
        "{:<38}  {:<18}  {:<5}  PROCESSED",
        "JOB_ID", "STATUS", "SEEN"
    );
    println!("{}", "-".repeat(90));
    for record in &records {
        println!(
            "{:<38}  {:<18}  {:<5}  {}",
            record.job_id,
            record.status.to_string(),
            record.occurrences,
            record.processed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} shown, {} stored", records.len(), store.len()?);
    Ok(())
}
