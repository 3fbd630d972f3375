use avatarsync::api;
use avatarsync::bridge::TransportBridge;
use avatarsync::config::AppConfig;
use avatarsync::api::metrics::init_metrics_recorder;
use avatarsync::mqtt::mqtt_handler::{log_status_changes, MqttLink};
use avatarsync::realtime::RealtimeHub;
use avatarsync::state::store::StateStore;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let config = AppConfig::load().await?;
    setup_logging_env(&config.log_level);
    info!(
        "Starting avatarsync: broker {}:{}, filter {}, activity timeout {:?}",
        config.mqtt.broker,
        config.mqtt.port,
        config.mqtt.topic_filter,
        config.activity_timeout()
    );

    let metrics = init_metrics_recorder()?;
    let shutdown = CancellationToken::new();

    let (store, resets) = StateStore::new(config.activity_timeout());
    let realtime = RealtimeHub::default();

    // Link -> bridge and bridge -> link queues
    let (inbound_tx, inbound_rx) = mpsc::channel(config.mqtt.channel_capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(config.mqtt.channel_capacity);

    let bridge = Arc::new(TransportBridge::new(
        store,
        realtime,
        outbound_tx,
        config.mqtt.topic_prefix.clone(),
    ));

    let link = MqttLink::new(config.mqtt.clone(), outbound_rx, inbound_tx);
    tokio::spawn(log_status_changes(link.status(), shutdown.clone()));
    let link_handle = tokio::spawn(link.run(shutdown.clone()));
    let bridge_handle = tokio::spawn(bridge.clone().run(inbound_rx, resets, shutdown.clone()));

    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| eyre!("Failed to bind to {}: {}", address, e))?;
    info!("Server running at http://{}/", address);

    let app = api::router(bridge.clone(), metrics);
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutdown requested");

    // Viewers and subscribers go back to baseline with the process
    bridge.reset().await;
    shutdown.cancel();

    if let Err(e) = link_handle.await {
        error!("MQTT link task failed: {}", e);
    }
    if let Err(e) = bridge_handle.await {
        error!("Bridge task failed: {}", e);
    }
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }

    info!("avatarsync stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
