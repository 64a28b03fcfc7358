//! Treeline orchestrator service.
//!
//! Consumes the context stream, fans tasks out to branch channels, and
//! optionally runs the chain-event bridge alongside.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use treeline_core::channels::{DeliveryMode, DurableChannels, InProcessChannels, TaskTransport};
use treeline_core::dispatcher::Dispatcher;
use treeline_core::log::{self, EventLog};
use treeline_server::bridge::{EventBridge, JsonFeedSource};
use treeline_server::config::ConfigLoader;
use treeline_server::shutdown;

/// Treeline - event log dispatcher for the branch network
#[derive(Parser, Debug)]
#[command(name = "treeline-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./treeline.toml")]
    config: PathBuf,

    /// Override the consumer name within the dispatcher group
    #[arg(long)]
    consumer: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();

    tracing::info!("Starting treeline-server v{}", env!("CARGO_PKG_VERSION"));

    let settings = ConfigLoader::new(&args.config, args.consumer)
        .load()
        .map_err(|e| {
            tracing::error!("Failed to load configuration: {}", e);
            e
        })?;

    tracing::info!("Connecting to event log...");
    let pool = log::connect(&settings.database_url).await.map_err(|e| {
        tracing::error!("Failed to open the log database: {}", e);
        e
    })?;
    log::init_schema(&pool).await?;
    tracing::info!("Event log ready");

    let event_log = EventLog::new(pool.clone(), &settings.stream);
    event_log.create_group(&settings.dispatcher.group).await?;

    let transport: Arc<dyn TaskTransport> = match settings.delivery_mode {
        DeliveryMode::BestEffort => Arc::new(InProcessChannels::new()),
        DeliveryMode::Durable => Arc::new(DurableChannels::new(pool.clone()).await?),
    };
    tracing::info!(mode = ?settings.delivery_mode, "task channels ready");

    let shutdown_rx = shutdown::spawn_shutdown_listener();

    // Optional producer adapter.
    let bridge_handle = settings.bridge.as_ref().map(|bridge_settings| {
        tracing::info!(
            feed = %bridge_settings.feed_path.display(),
            rpc_url = bridge_settings.rpc_url.as_deref().unwrap_or("-"),
            contract = bridge_settings.contract_address.as_deref().unwrap_or("-"),
            "starting event bridge"
        );
        let bridge = EventBridge::new(
            JsonFeedSource::new(&bridge_settings.feed_path),
            event_log.clone(),
            transport.clone(),
            bridge_settings.poll_interval,
        );
        tokio::spawn(bridge.run(shutdown_rx.clone()))
    });

    let dispatcher = Dispatcher::new(event_log, transport, settings.dispatcher);
    let stats = dispatcher.stats();
    let result = dispatcher.run(shutdown_rx).await;

    if let Some(handle) = bridge_handle {
        let _ = handle.await;
    }

    tracing::info!(
        events_processed = stats.events_processed(),
        malformed_events = stats.malformed_events(),
        dropped_publishes = stats.dropped_publishes(),
        cursor = stats.cursor(),
        "final dispatcher counters"
    );

    tracing::info!("Closing event log...");
    pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
