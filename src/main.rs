use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use national_treasure::config::Config;
use national_treasure::core::{CaptureResult, HeadlessMode, Job, JobType, ProgressState};
use national_treasure::services::browser::{BrowserPool, BrowserPoolConfig};
use national_treasure::services::capture::{CaptureFormat, CaptureOptions};
use national_treasure::services::learning::training::TrainingExport;
use national_treasure::services::queue::JobError;
use national_treasure::{CaptureService, DomainLearner, JobQueue, ScraperService, Store, TrainingService};

#[derive(Parser)]
#[command(name = "national-treasure", about = "Archives web pages and learns which browser configuration works per domain")]
struct Cli {
    /// Overrides the database path resolved from config/env.
    #[arg(long, global = true, env = "NT_DATABASE_PATH")]
    database_path: Option<PathBuf>,

    /// Path to a YAML config file (defaults to $NT_CONFIG_PATH if set).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture one URL or a batch of URLs.
    Capture {
        #[command(subcommand)]
        action: CaptureAction,
    },
    /// Inspect and drive the job queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Inspect and manage the selector/URL-pattern training store.
    Training {
        #[command(subcommand)]
        action: TrainingAction,
    },
    /// Inspect the adaptive domain-configuration learner.
    Learning {
        #[command(subcommand)]
        action: LearningAction,
    },
    /// Manage the SQLite store.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
    /// Prints the resolved configuration as YAML.
    Config,
}

#[derive(Subcommand)]
enum CaptureAction {
    /// Captures a single URL.
    Url {
        url: String,
        #[arg(long, default_value = "screenshot,pdf,html,warc")]
        formats: String,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Runs the browser with a visible window instead of headless.
        #[arg(long)]
        visible: bool,
        /// Skips post-navigation page behaviors (scrolling, dismissing overlays).
        #[arg(long)]
        no_behaviors: bool,
        #[arg(long, default_value_t = 30_000)]
        timeout: u64,
    },
    /// Captures every URL listed one-per-line in a file.
    Batch {
        file: PathBuf,
        #[arg(long, default_value = "screenshot,pdf,html,warc")]
        formats: String,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 4)]
        concurrent: usize,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Enqueues a capture job for one URL.
    Add {
        url: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Prints job counts grouped by status.
    Status,
    /// Runs queued jobs until interrupted.
    Run {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Lists dead-lettered jobs.
    DeadLetter {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum TrainingAction {
    /// Prints how many selector and URL patterns are stored.
    Stats,
    /// Exports stored patterns as JSON.
    Export {
        file: PathBuf,
        #[arg(long)]
        site: Option<String>,
    },
    /// Imports patterns from a JSON export.
    Import {
        file: PathBuf,
        #[arg(long)]
        merge: bool,
    },
}

#[derive(Subcommand)]
enum LearningAction {
    /// Prints what's been learned about one domain.
    Insights { domain: String },
    /// Prints aggregate learning statistics across all domains.
    Stats,
}

#[derive(Subcommand)]
enum DbAction {
    /// Creates the database file and applies the schema if missing.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Prints the database path and schema version.
    Info,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let database_path = cli.database_path.clone().unwrap_or_else(|| config.database_path());

    match cli.command {
        Command::Capture { action } => run_capture(action, &config, &database_path).await,
        Command::Queue { action } => run_queue(action, &database_path).await,
        Command::Training { action } => run_training(action, &database_path).await,
        Command::Learning { action } => run_learning(action, &database_path).await,
        Command::Db { action } => run_db(action, &database_path).await,
        Command::Config => {
            println!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

fn capture_options(formats: &str, no_behaviors: bool, timeout_ms: u64) -> CaptureOptions {
    let mut options = CaptureOptions::default();
    let parsed = CaptureFormat::parse_csv(formats);
    if !parsed.is_empty() {
        options.formats = parsed;
    }
    options.run_behaviors = !no_behaviors;
    options.timeout_ms = timeout_ms;
    options
}

async fn open_browser_pool(visible: bool) -> Result<Arc<BrowserPool>> {
    let mut pool_config = BrowserPoolConfig::default();
    if visible {
        pool_config.default_headless_mode = HeadlessMode::Visible;
    }
    let pool = BrowserPool::new(pool_config);
    pool.start().await.context("starting browser pool")?;
    Ok(pool)
}

async fn open_scraper(config: &Config, database_path: &std::path::Path, output: Option<PathBuf>, visible: bool) -> Result<ScraperService> {
    let store = Store::open(database_path).await.context("opening store")?;
    let pool = open_browser_pool(visible).await?;
    let output_dir = output.unwrap_or_else(|| config.archive_dir());
    let capture = CaptureService::new(pool, output_dir);
    let learner = DomainLearner::new(store);
    Ok(ScraperService::new(capture, learner))
}

async fn run_capture(action: CaptureAction, config: &Config, database_path: &std::path::Path) -> Result<()> {
    match action {
        CaptureAction::Url { url, formats, output, visible, no_behaviors, timeout } => {
            let scraper = open_scraper(config, database_path, output, visible).await?;
            let options = capture_options(&formats, no_behaviors, timeout);
            let result = scraper.capture_url(&url, &options).await.context("capturing url")?;
            print_capture_result(&result);
            Ok(())
        }
        CaptureAction::Batch { file, formats, output, concurrent } => {
            let contents = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let urls: Vec<String> = contents.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
            if urls.is_empty() {
                println!("no urls found in {}", file.display());
                return Ok(());
            }

            let scraper = open_scraper(config, database_path, output, false).await?;
            let options = capture_options(&formats, false, 30_000);
            let progress = Arc::new(Mutex::new(ProgressState::new(urls.len() as u64)));
            let results = scraper.capture_batch(&urls, &options, concurrent, progress).await;

            let succeeded = results.iter().filter(|r| r.success).count();
            println!("captured {succeeded}/{} urls", results.len());
            for result in &results {
                print_capture_result(result);
            }
            if succeeded == 0 {
                anyhow::bail!("all {} urls failed to capture", results.len());
            }
            Ok(())
        }
    }
}

fn print_capture_result(result: &CaptureResult) {
    if result.success {
        println!("ok   {} ({} words, {}ms)", result.url, result.word_count, result.duration_ms);
    } else {
        println!("fail {} ({})", result.url, result.error.as_deref().unwrap_or("unknown error"));
    }
}

async fn run_queue(action: QueueAction, database_path: &std::path::Path) -> Result<()> {
    let store = Store::open(database_path).await.context("opening store")?;

    match action {
        QueueAction::Add { url, priority } => {
            let queue = JobQueue::new(store, 5, 1_000, 4);
            let payload = serde_json::json!({ "url": url });
            let job_id = queue.enqueue(JobType::Capture, payload, priority, None, None).await.context("enqueueing job")?;
            println!("enqueued {job_id}");
            Ok(())
        }
        QueueAction::Status => {
            let queue = JobQueue::new(store, 5, 1_000, 4);
            let stats = queue.queue_stats().await.context("reading queue stats")?;
            for (status, count) in stats {
                println!("{status}: {count}");
            }
            Ok(())
        }
        QueueAction::Run { workers } => {
            let pool = open_browser_pool(false).await?;
            let capture = CaptureService::new(pool, PathBuf::from("./archive"));
            let learner = DomainLearner::new(store.clone());
            let scraper = Arc::new(ScraperService::new(capture, learner));

            let queue = Arc::new(JobQueue::new(store, 5, 1_000, 4));
            queue.register_handler(
                JobType::Capture,
                Arc::new(move |job: Job| {
                    let scraper = Arc::clone(&scraper);
                    Box::pin(async move {
                        let url = job
                            .payload
                            .get("url")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| JobError("payload missing url".into()))?;
                        let result = scraper.capture_url(url, &CaptureOptions::default()).await.map_err(|e| JobError(e.to_string()))?;
                        serde_json::to_value(&result).map_err(|e| JobError(e.to_string()))
                    })
                }),
            );

            queue.start(workers);
            println!("queue running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            println!("shutting down");
            queue.stop(true).await;
            Ok(())
        }
        QueueAction::DeadLetter { limit } => {
            let queue = JobQueue::new(store, 5, 1_000, 4);
            let entries = queue.dead_letter_list(limit, 0).await.context("listing dead letter entries")?;
            for entry in entries {
                println!("{} {} {} ({})", entry.job_id, entry.job_type.as_str(), entry.error, entry.failed_at);
            }
            Ok(())
        }
    }
}

async fn run_training(action: TrainingAction, database_path: &std::path::Path) -> Result<()> {
    let store = Store::open(database_path).await.context("opening store")?;
    let training = TrainingService::new(store);

    match action {
        TrainingAction::Stats => {
            let export = training.export_training_data(None).await.context("reading training data")?;
            println!("selectors: {}", export.selectors.len());
            println!("url patterns: {}", export.url_patterns.len());
            Ok(())
        }
        TrainingAction::Export { file, site } => {
            let export = training.export_training_data(site.as_deref()).await.context("exporting training data")?;
            let json = serde_json::to_string_pretty(&export).context("serializing training export")?;
            std::fs::write(&file, json).with_context(|| format!("writing {}", file.display()))?;
            println!("wrote {} selectors and {} url patterns to {}", export.selectors.len(), export.url_patterns.len(), file.display());
            Ok(())
        }
        TrainingAction::Import { file, merge } => {
            let contents = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let data: TrainingExport = serde_json::from_str(&contents).with_context(|| format!("parsing {}", file.display()))?;
            let counts = training.import_training_data(&data, merge).await.context("importing training data")?;
            println!("imported {} selectors and {} url patterns", counts.selectors, counts.url_patterns);
            Ok(())
        }
    }
}

async fn run_learning(action: LearningAction, database_path: &std::path::Path) -> Result<()> {
    let store = Store::open(database_path).await.context("opening store")?;
    let learner = DomainLearner::new(store);

    match action {
        LearningAction::Insights { domain } => {
            let insights = learner.get_domain_insights(&domain).await.context("reading domain insights")?;
            println!("domain: {}", insights.domain);
            println!("attempts: {}", insights.total_attempts);
            println!("success rate: {:.2}%", insights.success_rate * 100.0);
            if let Some(axis) = &insights.best_headless_mode {
                println!("best headless mode: {} ({:.2}%, {} attempts)", axis.key, axis.success_rate * 100.0, axis.attempts);
            }
            if let Some(axis) = &insights.best_wait_strategy {
                println!("best wait strategy: {} ({:.2}%, {} attempts)", axis.key, axis.success_rate * 100.0, axis.attempts);
            }
            if let Some(axis) = &insights.best_user_agent {
                println!("best user agent: {} ({:.2}%, {} attempts)", axis.key, axis.success_rate * 100.0, axis.attempts);
            }
            for recommendation in &insights.recommendations {
                println!("- {recommendation}");
            }
            Ok(())
        }
        LearningAction::Stats => {
            let stats = learner.get_global_stats().await.context("reading global stats")?;
            println!("domains: {}", stats.total_domains);
            println!("requests: {}", stats.total_requests);
            println!("overall success rate: {:.2}%", stats.overall_success_rate * 100.0);
            for config in &stats.top_performing_configs {
                println!("top config {} ({:.2}%, {} attempts)", config.config_key, config.success_rate * 100.0, config.attempts);
            }
            for domain in &stats.problematic_domains {
                println!("problem domain {} ({:.2}%, {} attempts)", domain.domain, domain.success_rate * 100.0, domain.attempts);
            }
            Ok(())
        }
    }
}

async fn run_db(action: DbAction, database_path: &std::path::Path) -> Result<()> {
    match action {
        DbAction::Init { force } => {
            if force && database_path.exists() {
                std::fs::remove_file(database_path).with_context(|| format!("removing {}", database_path.display()))?;
            }
            let store = Store::open(database_path).await.context("opening store")?;
            let version = store.schema_version().await.context("reading schema version")?;
            println!("database ready at {} (schema version {version})", database_path.display());
            Ok(())
        }
        DbAction::Info => {
            let store = Store::open(database_path).await.context("opening store")?;
            let version = store.schema_version().await.context("reading schema version")?;
            println!("path: {}", database_path.display());
            println!("schema version: {version}");
            Ok(())
        }
    }
}
