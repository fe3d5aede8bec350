//! `autotown` - CLI for the autotown telemetry service
//!
//! This binary wires the ingest pipeline, queue consumer, dispatcher and
//! exports to the bundled SQLite store and queue.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use autotown::cli::{
    Cli, Command, ConfigCommand, ExportCommand, IngestCommand, StatusCommand, TuneFormat,
};
use autotown::crash::{store_crash, FsBlobSink};
use autotown::export;
use autotown::migrate::IdentityMigrator;
use autotown::stats::StatsService;
use autotown::store::{MemoryStatsCache, QueueSource};
use autotown::{
    init_logging, Config, IngestOutcome, IngestPipeline, QueueConsumer, Redriver, RollupEngine,
    SqliteQueue, Storage,
};

/// Backing services opened from configuration.
struct App {
    config: Config,
    store: Arc<Storage>,
    queue: Arc<SqliteQueue>,
    cache: Arc<MemoryStatsCache>,
}

impl App {
    fn open(config: Config) -> anyhow::Result<Self> {
        let store = Storage::open(config.database_path())?;
        let queue = SqliteQueue::open(config.queue_path())?
            .with_visibility_timeout(config.worker.visibility_timeout())
            .with_max_attempts(config.worker.max_attempts);
        Ok(Self {
            config,
            store: Arc::new(store),
            queue: Arc::new(queue),
            cache: Arc::new(MemoryStatsCache::new()),
        })
    }

    fn pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(
            self.store.clone(),
            self.queue.clone(),
            self.config.ingest.clone(),
            self.config.rollup.lane.clone(),
        )
    }

    fn consumer(&self) -> QueueConsumer {
        let engine = RollupEngine::new(
            self.store.clone(),
            self.cache.clone(),
            self.config.rollup.clone(),
        );
        QueueConsumer::new(
            self.queue.clone(),
            self.store.clone(),
            engine,
            self.config.ingest.retry_lane.clone(),
            self.config.rollup.lane.clone(),
            self.config.worker.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
        command => run(App::open(config)?, command).await,
    }
}

async fn run(app: App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ingest(ingest_cmd) => handle_ingest(&app, ingest_cmd).await,
        Command::Crash(submit) => {
            let raw = read_input(&submit.file)?;
            let sink = FsBlobSink::new(app.config.blob_dir());
            let id = store_crash(
                app.store.as_ref(),
                &sink,
                &raw,
                &submit.envelope.to_envelope(),
            )
            .await?;
            println!("Stored crash report {id}");
            Ok(())
        }
        Command::Drain(drain_cmd) => {
            let consumer = app.consumer();
            if drain_cmd.follow {
                consumer
                    .run(async {
                        // Stop if the signal handler cannot be installed.
                        let _ = tokio::signal::ctrl_c().await;
                    })
                    .await?;
            } else {
                let summary = consumer.drain().await?;
                println!(
                    "Processed {}, released {}, dropped {}",
                    summary.processed, summary.released, summary.dropped
                );
            }
            Ok(())
        }
        Command::Redrive => {
            let redriver = Redriver::new(app.queue.clone(), app.config.rollup.clone());
            let summary = redriver.redrive_all(app.store.as_ref()).await?;
            println!(
                "Queued {} of {} usage reports in {} batches ({} skipped)",
                summary.enqueued, summary.records, summary.batches, summary.skipped
            );
            Ok(())
        }
        Command::MigrateIds(migrate_cmd) => {
            let migrator = IdentityMigrator::new(app.store.clone(), app.config.migration.clone());
            let summary = if migrate_cmd.all {
                migrator.migrate_all().await?
            } else {
                migrator.migrate_batch().await?
            };
            println!(
                "Examined {}, rewrote {}, skipped {}",
                summary.examined, summary.rewritten, summary.skipped
            );
            Ok(())
        }
        Command::Export(export_cmd) => handle_export(&app, export_cmd).await,
        Command::Stats(stats_cmd) => {
            let service = StatsService::new(app.store.clone(), app.cache.clone());
            let stats = if stats_cmd.refresh {
                service.refresh().await?
            } else {
                service.snapshot().await?
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Status(status_cmd) => handle_status(&app, &status_cmd).await,
        Command::Config(config_cmd) => handle_config(&app.config, config_cmd),
    }
}

async fn handle_ingest(app: &App, cmd: IngestCommand) -> anyhow::Result<()> {
    let pipeline = app.pipeline();
    let (kind, submit, outcome) = match cmd {
        IngestCommand::Tune(submit) => {
            let raw = read_input(&submit.file)?;
            let outcome = pipeline
                .ingest_tune(&raw, submit.envelope.to_envelope())
                .await?;
            ("tune", submit, outcome)
        }
        IngestCommand::Usage(submit) => {
            let raw = read_input(&submit.file)?;
            let outcome = pipeline
                .ingest_usage(&raw, submit.envelope.to_envelope())
                .await?;
            ("usage report", submit, outcome)
        }
    };

    match outcome {
        IngestOutcome::Stored(locator) => println!("{}", locator.url),
        IngestOutcome::Recorded(id) => println!("Stored {kind} {id}"),
        IngestOutcome::Deferred => println!(
            "Store unavailable; {kind} from {} queued for retry",
            submit.file.display()
        ),
    }
    Ok(())
}

async fn handle_export(app: &App, cmd: ExportCommand) -> anyhow::Result<()> {
    let store = app.store.as_ref();
    match cmd {
        ExportCommand::Tunes { format, output } => {
            let mut out = open_output(output.as_deref())?;
            match format {
                TuneFormat::Csv => export::write_tunes_csv(store, &mut out).await?,
                TuneFormat::Json => export::write_tunes_json(store, &mut out).await?,
            };
            out.flush()?;
        }
        ExportCommand::Boards { output } => {
            let mut out = open_output(output.as_deref())?;
            export::write_boards_csv(store, &mut out).await?;
            out.flush()?;
        }
        ExportCommand::RecentTunes { limit } => {
            let tunes = export::recent_tunes(store, limit).await?;
            println!("{}", serde_json::to_string_pretty(&tunes)?);
        }
        ExportCommand::Tune { locator } => {
            let detail = export::tune_detail(store, &locator).await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        ExportCommand::Crashes { limit } => {
            let crashes = export::recent_crashes(store, limit).await?;
            println!("{}", serde_json::to_string_pretty(&crashes)?);
        }
    }
    Ok(())
}

async fn handle_status(app: &App, cmd: &StatusCommand) -> anyhow::Result<()> {
    let stats = app.store.stats()?;
    let ingest_lane = &app.config.ingest.retry_lane;
    let rollup_lane = &app.config.rollup.lane;
    let ingest_depth = app.queue.depth(ingest_lane).await?;
    let rollup_depth = app.queue.depth(rollup_lane).await?;
    let ingest_parked = app.queue.parked(ingest_lane)?;
    let rollup_parked = app.queue.parked(rollup_lane)?;

    if cmd.json {
        let mut lanes = serde_json::Map::new();
        lanes.insert(
            ingest_lane.clone(),
            serde_json::json!({"pending": ingest_depth, "parked": ingest_parked}),
        );
        lanes.insert(
            rollup_lane.clone(),
            serde_json::json!({"pending": rollup_depth, "parked": rollup_parked}),
        );
        let status = serde_json::json!({
            "database_path": app.store.path(),
            "queue_path": app.queue.path(),
            "tunes": stats.tunes,
            "usage_reports": stats.usage_reports,
            "controllers": stats.controllers,
            "crashes": stats.crashes,
            "db_size_bytes": stats.db_size_bytes,
            "lanes": lanes,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("autotown status");
        println!("---------------");
        println!("Database:      {}", app.store.path().display());
        println!("Queue:         {}", app.queue.path().display());
        println!("Tunes:         {}", stats.tunes);
        println!("Usage reports: {}", stats.usage_reports);
        println!("Controllers:   {}", stats.controllers);
        println!("Crashes:       {}", stats.crashes);
        println!("Size:          {} bytes", stats.db_size_bytes);
        println!();
        println!("[Lanes]");
        println!("  {ingest_lane}: {ingest_depth} pending, {ingest_parked} parked");
        println!("  {rollup_lane}: {rollup_depth} pending, {rollup_parked} parked");
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Queue path:         {}", config.queue_path().display());
                println!("  Blob directory:     {}", config.blob_dir().display());
                println!();
                println!("[Ingest]");
                println!("  Retry lane:         {}", config.ingest.retry_lane);
                println!("  Locator base URL:   {}", config.ingest.locator_base_url);
                println!("  Deadline (ms):      {}", config.ingest.deadline_ms);
                println!();
                println!("[Rollup]");
                println!("  Lane:               {}", config.rollup.lane);
                println!("  Batch size:         {}", config.rollup.batch_size);
                println!(
                    "  Concurrent batches: {}",
                    config.rollup.max_concurrent_batches
                );
                println!();
                println!("[Worker]");
                println!("  Poll interval (ms): {}", config.worker.poll_interval_ms);
                println!("  Lease limit:        {}", config.worker.lease_limit);
                println!("  Max attempts:       {}", config.worker.max_attempts);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}

/// Read a whole document from a file, or stdin for "-".
fn read_input(path: &Path) -> anyhow::Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf).context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn open_output(path: Option<&Path>) -> anyhow::Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}
