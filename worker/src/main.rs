//! Entry point for the usage-engine worker: wires the store, the event
//! reconciler's queue consumer, the inspection orchestrator's retry sweep,
//! and the concurrency roll-up into a parallel worker pool (§5), the way
//! the teacher's `controller`/`agent` binaries wire their own watch loops
//! around `run_metrics_server`.
//!
//! Cloud ingest itself — the AWS audit-log poller and Azure periodic poller
//! that would populate `event_queue` (§6) — is not wired here: doing so for
//! real would mean depending on an AWS/Azure SDK, which nothing in this
//! codebase's dependency stack carries and which §4.G leaves to "any broker
//! offering these properties". The reconciler side of that queue has no
//! such dependency, so it is wired and driven here like any other sweep;
//! `usage_normalizer` remains library code a concrete poller calls into
//! before enqueueing onto `event_queue`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use prometheus::{Encoder, IntGauge, TextEncoder};
use usage_inspector::InspectionWork;
use usage_queue::{InMemoryWorkQueue, WorkQueue};
use usage_reconciler::ReconciliationWork;
use usage_shared::config::Settings;
use usage_store::PgStore;
use warp::Filter;

#[derive(Parser, Debug)]
#[command(about = "Multi-cloud usage-tracking worker")]
struct Cli {
    /// Postgres connection string; also read from `DATABASE_URL`.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum size of the Postgres connection pool.
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 10)]
    db_max_connections: u32,

    /// Port the Prometheus `/metrics` endpoint listens on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    metrics_port: u16,

    /// How often the inspection retry sweep runs.
    #[arg(long, env = "INSPECTION_RETRY_POLL_SECONDS", default_value_t = 300)]
    inspection_retry_poll_seconds: u64,

    /// Maximum images examined per retry sweep pass.
    #[arg(long, env = "INSPECTION_RETRY_LIMIT", default_value_t = 100)]
    inspection_retry_limit: u32,

    /// How often the concurrency roll-up runs for today and yesterday.
    #[arg(long, env = "ROLLUP_POLL_SECONDS", default_value_t = 3600)]
    rollup_poll_seconds: u64,

    /// How often the reconciler consumer polls the event queue.
    #[arg(long, env = "RECONCILE_POLL_SECONDS", default_value_t = 5)]
    reconcile_poll_seconds: u64,

    /// Maximum event-work messages drained per reconciler poll.
    #[arg(long, env = "RECONCILE_BATCH_SIZE", default_value_t = 50)]
    reconcile_batch_size: usize,
}

lazy_static::lazy_static! {
    static ref INSPECTION_RETRY_SWEEP_RUNS: IntGauge =
        prometheus::register_int_gauge!("usage_engine_inspection_retry_sweep_runs_total", "Completed inspection retry sweeps").unwrap();
    static ref ROLLUP_SWEEP_RUNS: IntGauge =
        prometheus::register_int_gauge!("usage_engine_rollup_sweep_runs_total", "Completed concurrency roll-up sweeps").unwrap();
    static ref RECONCILE_WORK_PROCESSED: IntGauge =
        prometheus::register_int_gauge!("usage_engine_reconcile_work_processed_total", "Event-work messages reconciled").unwrap();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    env_logger::try_init()?;
    info!("usage-engine worker start");

    let cli = Cli::parse();
    let settings = Arc::new(Settings::load()?);

    let store: Arc<PgStore> = Arc::new(PgStore::connect(&cli.database_url, cli.db_max_connections).await?);
    store.migrate().await?;

    let inspection_queue: Arc<InMemoryWorkQueue<InspectionWork>> =
        Arc::new(InMemoryWorkQueue::new(3, Duration::from_secs(30)));
    let event_queue: Arc<InMemoryWorkQueue<ReconciliationWork>> =
        Arc::new(InMemoryWorkQueue::new(3, Duration::from_secs(30)));

    let tasks = vec![
        tokio::spawn(run_metrics_server(cli.metrics_port)),
        tokio::spawn(run_event_reconciliation_consumer(
            store.clone(),
            event_queue.clone(),
            Duration::from_secs(cli.reconcile_poll_seconds),
            cli.reconcile_batch_size,
        )),
        tokio::spawn(run_inspection_retry_sweep(
            store.clone(),
            inspection_queue.clone(),
            settings.clone(),
            Duration::from_secs(cli.inspection_retry_poll_seconds),
            cli.inspection_retry_limit,
        )),
        tokio::spawn(run_rollup_sweep(
            store.clone(),
            Duration::from_secs(cli.rollup_poll_seconds),
        )),
    ];

    futures::future::try_join_all(tasks).await?;
    info!("usage-engine worker end");
    Ok(())
}

async fn metrics_handler() -> Result<impl warp::Reply, std::convert::Infallible> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .expect("couldn't encode prometheus metrics");
    Ok(String::from_utf8(buffer).expect("prometheus metrics could not be converted to String"))
}

/// Serves Prometheus metrics over `/metrics`, the way the teacher's
/// `akri::metrics::run_metrics_server` does.
async fn run_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    info!("starting metrics server on port {port} at /metrics");
    let metrics_route = warp::path!("metrics").and_then(metrics_handler);
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
    Ok(())
}

/// Drains `event_queue` and reconciles each batch of freshly normalized
/// events into runs (component D), the "receive, process, ack-or-nack"
/// cycle `usage_queue::WorkQueue` is built around.
async fn run_event_reconciliation_consumer(
    store: Arc<PgStore>,
    queue: Arc<InMemoryWorkQueue<ReconciliationWork>>,
    period: Duration,
    batch_size: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let messages = match queue.receive(batch_size).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("event queue receive failed: {e}");
                continue;
            }
        };
        for message in messages {
            match usage_reconciler::process_reconciliation_work(store.as_ref(), message.payload.clone()).await {
                Ok(runs) => {
                    RECONCILE_WORK_PROCESSED.inc();
                    info!(
                        "reconciled instance {} into {} run(s)",
                        message.payload.instance_id,
                        runs.len()
                    );
                    if let Err(e) = queue.ack(message.id).await {
                        warn!("failed to ack reconciled event work {}: {e}", message.id);
                    }
                }
                Err(e) => {
                    warn!("reconciliation failed for instance {}: {e}", message.payload.instance_id);
                    if let Err(e) = queue.nack(message.id).await {
                        warn!("failed to nack event work {}: {e}", message.id);
                    }
                }
            }
        }
    }
}

/// Periodically re-drives `pending` images older than
/// `inspection.min_age_seconds` (§4.E).
async fn run_inspection_retry_sweep(
    store: Arc<PgStore>,
    queue: Arc<InMemoryWorkQueue<InspectionWork>>,
    settings: Arc<Settings>,
    period: Duration,
    limit: u32,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();
        match usage_inspector::retry_sweep(
            store.as_ref(),
            queue.as_ref(),
            &settings,
            limit,
            now,
            |image| image.discovered_at,
        )
        .await
        {
            Ok(retried) => {
                INSPECTION_RETRY_SWEEP_RUNS.inc();
                info!("inspection retry sweep retried {retried} image(s)");
            }
            Err(e) => warn!("inspection retry sweep failed: {e}"),
        }
    }
}

/// Periodically rolls up concurrency for every user active today and
/// yesterday (§4.F): yesterday in case today's UTC rollover happened after
/// the last run still affected yesterday's totals, today so partial-day
/// totals stay current for dashboards.
async fn run_rollup_sweep(
    store: Arc<PgStore>,
    period: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let today = chrono::Utc::now().date_naive();
        let yesterday = today - chrono::Duration::days(1);
        for day in [yesterday, today] {
            match usage_rollup::roll_up_all_users(store.as_ref(), day).await {
                Ok(count) => {
                    ROLLUP_SWEEP_RUNS.inc();
                    info!("rolled up concurrency for {count} user(s) on {day}");
                }
                Err(e) => warn!("concurrency roll-up for {day} failed: {e}"),
            }
        }
    }
}
