//! Stockbot - VPS Restock Monitor Backend
//! Mission: catch restocks before humans finish refreshing the page
//!
//! One process, four long-lived tasks: the poll scheduler with its
//! worker pool, the notification aggregator, a history pruner, and the
//! bot-facing JSON API. Everything shuts down on ctrl-c with a bounded
//! grace period.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockbot_backend::{
    api::{self, OneShotCheck},
    config::Config,
    detectors,
    fetcher::{render::RenderPool, HttpFetcher, PageFetcher},
    models::CheckRecord,
    notifier::{sink::TracingSink, NotificationAggregator},
    scheduler::{CheckRunner, Scheduler},
    service::MonitorService,
    store::Store,
};

/// Exit codes the supervisor keys on.
const EXIT_CONFIG: u8 = 1;
const EXIT_MIGRATION: u8 = 2;
const EXIT_RUNTIME: u8 = 3;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "stockbot", about = "VPS restock monitor backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor (default).
    Run,
    /// One-shot diagnostic poll of a single item.
    Check { item_id: String },
    /// Print the effective configuration and exit.
    DumpConfig,
    /// Force one history/ledger pruning pass and exit.
    Prune,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stockbot_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::DumpConfig => match toml::to_string_pretty(config.as_ref()) {
            Ok(s) => {
                println!("{}", s);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Failed to serialize config: {}", e);
                ExitCode::from(EXIT_RUNTIME)
            }
        },
        command => {
            // Everything else needs the store; a failure here is almost
            // always a migration refusing to apply.
            let store = match Store::open(&config.database_path) {
                Ok(s) => s,
                Err(e) => {
                    error!("Store initialization failed: {:#}", e);
                    return ExitCode::from(EXIT_MIGRATION);
                }
            };
            let result = match command {
                Command::Run => run_monitor(config, store).await,
                Command::Check { item_id } => run_check(config, store, &item_id).await,
                Command::Prune => run_prune(config, store).await,
                Command::DumpConfig => unreachable!(),
            };
            match result {
                Ok(code) => code,
                Err(e) => {
                    error!("Fatal: {:#}", e);
                    ExitCode::from(EXIT_RUNTIME)
                }
            }
        }
    }
}

struct OneShot {
    runner: Arc<CheckRunner>,
    store: Store,
}

#[async_trait::async_trait]
impl OneShotCheck for OneShot {
    async fn check_now(&self, item_id: &str) -> Result<Option<CheckRecord>> {
        let Some(item) = self.store.get_item(item_id).await? else {
            return Ok(None);
        };
        let summary = self.runner.check_item(&item).await?;
        Ok(Some(summary.record))
    }
}

fn build_fetcher(config: &Config) -> Result<Arc<dyn PageFetcher>> {
    if config.enable_render {
        // The render engine binds at deployment; without one the pool
        // degrades to raw fetches.
        warn!("enable_render is set but no render engine is bound in this build");
    }
    let render_pool = Arc::new(RenderPool::disabled());
    Ok(Arc::new(HttpFetcher::new(
        config.fetch_timeout_duration(),
        render_pool,
    )?))
}

async fn run_monitor(config: Arc<Config>, store: Store) -> Result<ExitCode> {
    info!("🚀 Stockbot monitor starting");
    info!(
        "   {} item(s) in catalog, db at {}",
        store.item_count().await.unwrap_or(0),
        config.database_path
    );
    if config.admin_ids.is_empty() {
        warn!("⚠️  No admin_ids configured - admin notifications have nowhere to go");
    }

    let fetcher = build_fetcher(&config)?;
    let sink = Arc::new(TracingSink);
    let (aggregator, events_tx) =
        NotificationAggregator::new(store.clone(), config.clone(), sink);

    let detector_set = detectors::standard_set(&config);
    let scheduler = Scheduler::new(
        store.clone(),
        config.clone(),
        fetcher.clone(),
        detector_set.clone(),
        events_tx.clone(),
    );

    // Shared shutdown signal; flipping it once is enough for everyone.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let aggregator_task = tokio::spawn(aggregator.run(shutdown_rx.clone()));
    let prune_task = tokio::spawn(prune_loop(
        store.clone(),
        config.clone(),
        shutdown_rx.clone(),
    ));

    // Bot-facing API.
    let service = MonitorService::new(store.clone(), config.clone());
    let oneshot_runner = Arc::new(CheckRunner::new(
        store.clone(),
        config.clone(),
        fetcher,
        detector_set,
        events_tx,
    ));
    let api_state = api::ApiState {
        service,
        store: store.clone(),
        oneshot: Arc::new(OneShot {
            runner: oneshot_runner,
            store: store.clone(),
        }),
    };
    let router = api::routes::router(api_state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("bind port {}", config.listen_port))?;
    info!("🌐 API listening on 0.0.0.0:{}", config.listen_port);

    let mut api_shutdown = shutdown_rx.clone();
    let api_task = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!("API server exited with error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("listen for ctrl-c")?;
    info!("🛑 Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.shutdown_grace);
    for (name, task) in [
        ("scheduler", scheduler_task),
        ("aggregator", aggregator_task),
        ("pruner", prune_task),
        ("api", api_task),
    ] {
        if tokio::time::timeout(grace, task).await.is_err() {
            warn!("{} did not stop within grace; abandoning", name);
        }
    }

    info!("👋 Stockbot monitor stopped");
    Ok(ExitCode::from(EXIT_CANCELLED))
}

/// Daily-ish retention pass: old check history and ledger rows go, the
/// newest records per item stay.
async fn prune_loop(store: Store, config: Arc<Config>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = prune_once(&store, &config).await {
                    warn!("Prune pass failed: {:#}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn prune_once(store: &Store, config: &Config) -> Result<(usize, usize)> {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(config.history_retention_days);
    let history = store
        .prune_history(cutoff, config.history_keep_per_item, config.prune_batch_cap)
        .await?;
    let ledger = store.prune_ledger(cutoff, config.prune_batch_cap).await?;
    if history > 0 || ledger > 0 {
        store.optimize().await.ok();
    }
    Ok((history, ledger))
}

async fn run_check(config: Arc<Config>, store: Store, item_id: &str) -> Result<ExitCode> {
    let fetcher = build_fetcher(&config)?;
    // One-shot polls still feed the event queue; with no aggregator
    // running the events simply evaporate with the process.
    let (events_tx, _events_rx) = mpsc::channel(16);
    let runner = CheckRunner::new(
        store.clone(),
        config.clone(),
        fetcher,
        detectors::standard_set(&config),
        events_tx,
    );

    let Some(item) = store.get_item(item_id).await? else {
        error!("No such item: {}", item_id);
        return Ok(ExitCode::from(EXIT_RUNTIME));
    };

    info!("🔍 One-shot check of {} ({})", item.name, item.url);
    let summary = runner.check_item(&item).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary.record).context("encode record")?
    );
    info!(
        "Result: {} at {:.2} (status now {})",
        summary.record.verdict.as_str(),
        summary.record.confidence,
        summary.new_status.as_str()
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_prune(config: Arc<Config>, store: Store) -> Result<ExitCode> {
    let (history, ledger) = prune_once(&store, &config).await?;
    info!(
        "🧹 Prune complete: {} history rows, {} ledger rows removed",
        history, ledger
    );
    Ok(ExitCode::SUCCESS)
}
