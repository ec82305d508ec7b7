//! Process entry point: wires the bootstrap settings into a catalog
//! connection, the chain orchestrator's periodic loop, the statistics
//! sampler, and the DICOM SCP listener, then runs all three concurrently.

use draw_client::catalog::{connect_pool, CatalogRepo};
use draw_client::config::{load_bootstrap_settings, LogFormat};
use draw_client::scp::{run_scp_listener, spawn_transaction_log_writer, ScpContext, StorageCache};
use draw_client::{chain, scp};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const TRANSACTION_LOG_QUEUE_CAPACITY: usize = 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_bootstrap_settings()?;
    init_tracing(settings.log_format)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(settings));

    global::shutdown_tracer_provider();
    result
}

async fn run(settings: draw_client::config::BootstrapSettings) -> Result<(), Box<dyn std::error::Error>> {
    let pool = connect_pool(&settings.database_url, settings.db_max_connections).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    let repo = CatalogRepo::new(pool);

    repo.mark_service_started(std::process::id() as i32).await?;

    let scp_config = repo.load_scp_config().await?;
    let initial_usage = scp::storage_cache::rescan_disk_usage(&settings.scp_storage_root);
    repo.set_cached_storage(initial_usage as i64).await?;
    let storage_cache = Arc::new(StorageCache::new(initial_usage));
    let tx_log = spawn_transaction_log_writer(repo.clone(), TRANSACTION_LOG_QUEUE_CAPACITY);

    let scp_ctx = Arc::new(ScpContext {
        repo: repo.clone(),
        config: scp_config,
        storage_root: settings.scp_storage_root.clone(),
        storage_cache,
        tx_log,
        runtime: tokio::runtime::Handle::current(),
    });

    let scp_handle = {
        let scp_ctx = Arc::clone(&scp_ctx);
        tokio::task::spawn_blocking(move || run_scp_listener(scp_ctx))
    };

    let chain_handle = tokio::spawn(chain_loop(repo.clone(), settings.chain_interval));
    let stats_handle = tokio::spawn(stats_loop(repo.clone(), settings.stats_interval));

    tokio::select! {
        result = scp_handle => { result??; }
        result = chain_handle => { result?; }
        result = stats_handle => { result?; }
    }
    Ok(())
}

/// Drives the chain orchestrator on a fixed interval, per spec.md §4.9. The
/// chain lock makes this safe to run from more than one process; here a
/// single process just re-enters on its own cadence.
async fn chain_loop(repo: CatalogRepo, interval: Duration) {
    let client = reqwest::Client::new();
    let mut state = chain::ChainState::new(interval);
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = chain::run_once(&repo, &client, &mut state, interval * 4).await {
            tracing::error!(error = %e, "chain pass failed");
        }
    }
}

/// Periodic statistics sampler, per spec.md §4.9's "separate periodic job".
async fn stats_loop(repo: CatalogRepo, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = chain::sample_statistics(&repo).await {
            tracing::warn!(error = %e, "statistics sampling failed");
        }
    }
}

fn init_tracing(format: LogFormat) -> Result<(), opentelemetry::trace::TraceError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    match format {
        LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Json => subscriber.json().init(),
    }

    global::set_text_map_propagator(TraceContextPropagator::new());
    let exporter = opentelemetry_otlp::new_exporter().http().build_span_exporter()?;
    let provider = TracerProvider::builder().with_simple_exporter(exporter).build();
    global::set_tracer_provider(provider);
    Ok(())
}
