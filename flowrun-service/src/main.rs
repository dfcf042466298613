//! flowrun service
//!
//! Wires the execution engine to its backing services and serves:
//! - Run API (start, inspect, resume, progress)
//! - Callback ingress for HTTP callback nodes
//! - Event emission
//! - Prometheus scrape and JSON metrics

use anyhow::{Context, Result};
use clap::Parser;
use flowrun_callback::{CallbackNotifier, LocalNotifier, RedisNotifier};
use flowrun_core::config::{load_environment, EngineConfig};
use flowrun_engine::{ActionRegistry, EngineContext, FlowEngine};
use flowrun_state_store::{MemoryStore, RedisStore, RetryingStore, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod flows;
mod http;

/// How often the in-memory store drops expired records
const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "flowrun-service")]
#[command(about = "Flow execution engine with callback, timer and event resumption")]
struct Args {
    /// Bind address (host:port)
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Directory of flow definition JSON files
    #[arg(long)]
    flows: Option<PathBuf>,

    /// Redis URL (overrides FLOWRUN_REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("flowrun_service=info".parse()?)
        .add_directive("flowrun_engine=info".parse()?)
        .add_directive("flowrun_callback=info".parse()?)
        .add_directive("flowrun_timer=info".parse()?)
        .add_directive("flowrun_state_store=info".parse()?)
        .add_directive("tower_http=debug".parse()?);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn backends(
    config: &EngineConfig,
) -> Result<(Arc<dyn StateStore>, Arc<dyn CallbackNotifier>)> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .with_context(|| format!("connecting state store to {}", url))?;
            let notifier = RedisNotifier::connect(url)
                .await
                .context("connecting callback notifier")?;
            info!("Using Redis state store and pub/sub notifier");
            Ok((
                Arc::new(RetryingStore::new(store, config.store_retry.clone())),
                Arc::new(notifier),
            ))
        }
        None => {
            warn!("FLOWRUN_REDIS_URL not set, state is kept in memory and lost on restart");
            let store = Arc::new(MemoryStore::new());
            store.spawn_purger(MEMORY_PURGE_INTERVAL);
            let notifier: Arc<dyn CallbackNotifier> = Arc::new(LocalNotifier::new());
            Ok((store as Arc<dyn StateStore>, notifier))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = load_environment();
    let args = Args::parse();
    init_tracing(args.log_json)?;
    if let Some(path) = env_file {
        info!("Loaded environment from {}", path);
    }

    let mut config = EngineConfig::from_env();
    if args.redis_url.is_some() {
        config.redis_url = args.redis_url.clone();
    }

    flowrun_state_store::metrics::register_metrics();
    let (store, notifier) = backends(&config).await?;
    let (ctx, fires) = EngineContext::build(config, store, notifier, ActionRegistry::with_builtins())?;
    let engine = FlowEngine::new(ctx);

    if let Some(dir) = &args.flows {
        let loaded = flows::load_dir(&engine, dir)?;
        info!("Registered {} flow(s) from {}", loaded, dir.display());
    }

    let dispatcher = engine.spawn_timer_dispatcher(fires);
    let restored = engine.context().timers.restore().await?;
    info!("Restored {} timer job(s)", restored);
    let waits = engine.restore_waits().await?;
    info!("Restored {} callback/event wait(s)", waits);

    let app = http::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!("Listening on {}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.context().timers.shutdown();
    dispatcher.abort();
    info!("flowrun service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
