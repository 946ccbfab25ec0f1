//! OBD Poller - Main Entry Point
//!
//! Loads the PID configuration, builds the polling engine and drives it until
//! Ctrl-C. The bench build talks to the simulated ECU; a hardware adapter
//! plugs in through `CanTransport` for sending and a `FrameSink` on its
//! receive path.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use obd_protocol::{frame_channel, SimulatedEcu};
use obd_scheduler::{ObdConfig, PollerSetup, SensorValue};
use std::fmt::Debug;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Config file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "obd.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    info!("=== OBD Poller v{} ===", env!("CARGO_PKG_VERSION"));

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = ObdConfig::load(&path).with_context(|| format!("loading {path}"))?;

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid metrics_addr {addr}"))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!("Metrics exporter listening on {}", addr);
    }

    let (sink, mut frames) = frame_channel(config.inbound_queue_capacity);
    let PollerSetup {
        mut engine,
        sensors,
        binary_sensors,
        frames: published,
        ..
    } = config.build(SimulatedEcu::new(sink))?;
    engine.log_config();

    for (name, value) in sensors {
        tokio::spawn(report(name, value));
    }
    for (name, value) in binary_sensors {
        tokio::spawn(report(name, value));
    }
    for (name, value) in published {
        tokio::spawn(report(name, value));
    }

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = stop.send(true);
            }
            Err(e) => {
                warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    engine
        .run(&mut frames, config.tick_interval(), shutdown)
        .await;

    if frames.dropped() > 0 {
        warn!("{} inbound frames dropped on a full queue", frames.dropped());
    }
    Ok(())
}

/// Log every value a sensor publishes
async fn report<T>(name: String, mut value: SensorValue<T>)
where
    T: Debug + Clone + Send + Sync,
{
    while value.changed().await.is_ok() {
        if let Some(v) = value.borrow_and_update().clone() {
            info!("{}: {:?}", name, v);
        }
    }
}

/// Initialize logging; `OBD_LOG_LEVEL` overrides the default INFO level
fn init_logging() -> anyhow::Result<()> {
    let level = std::env::var("OBD_LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")
}
