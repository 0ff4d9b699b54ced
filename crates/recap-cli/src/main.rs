mod summarize;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use recap_core::app::{AppBuilder, WorkerPoolHandle};
use recap_core::config::RecapConfig;
use recap_core::domain::JobId;
use recap_core::impls::{InMemoryQueueStore, PgQueueStore, TracingEventSink};
use recap_core::observability::init_tracing;
use recap_core::ports::{QueueCounts, QueueStore};
use recap_core::typed::{QueueStoreExt, SummarizeMeeting, Task};
use tracing::{info, warn};

use crate::summarize::{InMemoryMeetings, MeetingRepository, SummarizeHandler};

#[derive(Debug, Parser)]
#[command(name = "recap", version, about = "Meeting summarization job worker")]
struct Cli {
    /// Config file (defaults to an optional ./recap.toml)
    #[arg(long, global = true, env = "RECAP_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL URL; overrides the configured one
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker pool until Ctrl-C
    Run {
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Summarize sample meetings on an in-memory queue
    Demo {
        #[arg(long, default_value_t = 5)]
        meetings: usize,

        /// Fail this many attempts of every job before succeeding
        #[arg(long, default_value_t = 1)]
        fail_first: u32,

        /// Backoff base delay in milliseconds
        #[arg(long, default_value_t = 200)]
        base_delay_ms: u64,
    },

    /// Enqueue a summarize job for a meeting
    Enqueue { meeting_id: String },

    /// List terminally failed jobs
    Failed {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Move a failed job back to pending
    Requeue { job_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = RecapConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    init_tracing(&config.log);

    match cli.command {
        Command::Run { concurrency } => {
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            config.validate()?;
            run(config).await
        }
        Command::Demo {
            meetings,
            fail_first,
            base_delay_ms,
        } => {
            config.queue.base_delay_ms = base_delay_ms;
            config.database_url = None;
            config.validate()?;
            demo(config, meetings, fail_first).await
        }
        Command::Enqueue { meeting_id } => {
            let store = postgres(&config).await?;
            let id = store.enqueue_task(&SummarizeMeeting::new(meeting_id)).await?;
            println!("{id}");
            Ok(())
        }
        Command::Failed { limit } => {
            let store = postgres(&config).await?;
            for job in store.list_failed(limit).await? {
                println!("{}", serde_json::to_string(&job)?);
            }
            Ok(())
        }
        Command::Requeue { job_id } => {
            let store = postgres(&config).await?;
            let id: JobId = job_id
                .parse()
                .with_context(|| format!("invalid job id {job_id:?}"))?;
            if !store.requeue_failed(id).await? {
                bail!("{id} is not a failed job");
            }
            println!("requeued {id}");
            Ok(())
        }
    }
}

async fn postgres(config: &RecapConfig) -> anyhow::Result<PgQueueStore> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("this command needs a database: set RECAP_DATABASE_URL or --database-url");
    };
    let store = PgQueueStore::connect(url, config.worker.db_max_connections, &config.queue)
        .await
        .context("connecting to PostgreSQL")?
        .with_event_sink(Arc::new(TracingEventSink));
    store.migrate().await.context("creating the jobs table")?;
    Ok(store)
}

async fn open_store(config: &RecapConfig) -> anyhow::Result<Arc<dyn QueueStore>> {
    if config.database_url.is_some() {
        return Ok(Arc::new(postgres(config).await?));
    }
    warn!("no database_url configured; using the in-memory store (jobs are lost on exit)");
    Ok(Arc::new(
        InMemoryQueueStore::new(&config.queue).with_event_sink(Arc::new(TracingEventSink)),
    ))
}

fn start(
    config: &RecapConfig,
    store: Arc<dyn QueueStore>,
    handler: SummarizeHandler,
) -> anyhow::Result<WorkerPoolHandle> {
    let app = AppBuilder::from_config(config)
        .store(store)
        .register::<SummarizeMeeting, _>(handler)?
        .expect_kinds(&[SummarizeMeeting::KIND])
        .build()?;
    Ok(app.start())
}

/// Only the in-memory meeting repository exists. Pairing it with a durable
/// queue would mark every real job completed without summarizing anything.
fn meeting_repository(config: &RecapConfig) -> anyhow::Result<Arc<dyn MeetingRepository>> {
    if config.database_url.is_some() {
        bail!(
            "`run` has no PostgreSQL meeting repository; refusing to drain a durable queue \
             against empty in-memory meetings (unset database_url, or use `demo`)"
        );
    }
    warn!("meetings are held in memory and start empty; summarize jobs will find nothing");
    Ok(Arc::new(InMemoryMeetings::new()))
}

async fn run(config: RecapConfig) -> anyhow::Result<()> {
    let meetings = meeting_repository(&config)?;
    let store = open_store(&config).await?;
    let pool = start(&config, store, SummarizeHandler::new(meetings))?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown requested; finishing in-flight jobs");

    let stats = pool.shutdown_and_join().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn demo(config: RecapConfig, meetings: usize, fail_first: u32) -> anyhow::Result<()> {
    if fail_first >= config.queue.max_attempts {
        warn!(
            fail_first,
            max_attempts = config.queue.max_attempts,
            "every job will exhaust its attempts"
        );
    }

    let repo = Arc::new(InMemoryMeetings::new());
    for i in 1..=meetings {
        repo.insert(format!("m{i}"), sample_transcript(i));
    }

    let store = open_store(&config).await?;
    for i in 1..=meetings {
        store.enqueue_task(&SummarizeMeeting::new(format!("m{i}"))).await?;
    }

    let handler = SummarizeHandler::new(repo.clone()).failing_first(fail_first);
    let pool = start(&config, Arc::clone(&store), handler)?;

    let counts = wait_until_drained(store.as_ref()).await?;
    let stats = pool.shutdown_and_join().await;

    for summary in repo.summaries() {
        println!("== {} ==\n{}\n", summary.meeting_id, summary.content);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "counts": counts, "stats": stats }))?
    );
    Ok(())
}

async fn wait_until_drained(store: &dyn QueueStore) -> anyhow::Result<QueueCounts> {
    loop {
        let counts = store.counts().await?;
        if counts.is_drained() {
            return Ok(counts);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn sample_transcript(i: usize) -> String {
    format!(
        "Weekly sync number {i}. The team reviewed the release checklist.\n\
         Dana will follow up with the design team about the onboarding flow.\n\
         Metrics are trending up. Action: Eli to draft the Q{q} plan by Friday",
        q = i % 4 + 1
    )
}
