use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fixrelay_ble::ConnectionManager;
use fixrelay_core::config::OutboxBackend;
use fixrelay_core::RelayConfig;
use fixrelay_outbox::{MemoryOutbox, Outbox, RedisOutbox};
use fixrelay_protocol::TopicBuilder;
use fixrelay_relay::{MqttPublisher, RelayPublisher};

const DEFAULT_CONFIG_PATH: &str = "fixrelay.json";
const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,fixrelay=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = config_path();
    let config = RelayConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    tracing::info!(
        "fixrelay starting with {} allow-listed devices",
        config.devices.len()
    );

    match config.outbox.backend {
        OutboxBackend::Redis => {
            let outbox = RedisOutbox::connect(
                &config.outbox.redis_url,
                &config.outbox.list_key,
                &config.outbox.entry_prefix,
            )
            .await
            .context("connecting to outbox store")?;
            run(config, Arc::new(outbox)).await
        }
        OutboxBackend::Memory => {
            tracing::warn!("Using in-memory outbox; queued fixes are lost on exit");
            run(config, Arc::new(MemoryOutbox::new())).await
        }
    }
}

/// Config file: first argument, then `FIXRELAY_CONFIG`, then the default.
fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FIXRELAY_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into()
}

/// Identity used in the publish topic.
fn host_identity(config: &RelayConfig) -> anyhow::Result<String> {
    if let Some(identity) = &config.host_identity {
        return Ok(identity.clone());
    }
    let hostname = std::fs::read_to_string(HOSTNAME_PATH).context("reading hostname")?;
    let hostname = hostname.trim();
    anyhow::ensure!(!hostname.is_empty(), "empty hostname; set hostIdentity");
    Ok(hostname.to_string())
}

/// Start ingestion and relay, then wait for Ctrl+C.
async fn run<O: Outbox>(config: RelayConfig, outbox: Arc<O>) -> anyhow::Result<()> {
    let identity = host_identity(&config)?;
    let topic = TopicBuilder::new(&config.mqtt.topic_prefix).fix_topic(&identity);
    let client_id = config.mqtt.client_id.clone().unwrap_or_else(|| identity.clone());

    let publisher = MqttPublisher::connect(&config.mqtt, &client_id)
        .await
        .context("starting MQTT connection")?;
    let ble = ConnectionManager::new(
        config.ble.adapter_index,
        &config.devices,
        config.gps.fix_quality_threshold,
        outbox.clone(),
    )
    .await
    .context("opening Bluetooth adapter")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ble_shutdown = shutdown_rx.clone();
    let ble_handle = tokio::spawn(async move {
        if let Err(e) = ble.run(ble_shutdown).await {
            tracing::error!("BLE ingestion stopped: {}", e);
        }
    });
    let relay = RelayPublisher::new(outbox, publisher, topic, config.relay.poll_interval());
    let relay_handle = tokio::spawn(relay.run(shutdown_rx));

    tracing::info!("fixrelay ready, publishing as {}", identity);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down...");
    if shutdown_tx.send(true).is_err() {
        tracing::debug!("All tasks already stopped");
    }

    if let Err(e) = ble_handle.await {
        tracing::error!("BLE task failed: {}", e);
    }
    if let Err(e) = relay_handle.await {
        tracing::error!("Relay task failed: {}", e);
    }

    tracing::info!("fixrelay stopped");
    Ok(())
}
