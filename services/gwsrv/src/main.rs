//! Gateway Service (gwsrv)
//!
//! Polls Modbus TCP/RTU drives and LOGO controllers and bridges them to the
//! cloud bus over MQTT.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use common::logging::{self, LogConfig};
use gwsrv::bus::{BusMessage, MqttBus, SignalSink, StatusSink};
use gwsrv::config::{AppConfig, DEFAULT_CONFIG_PATH};
use gwsrv::core::device::{load_roster, DeviceRecord};
use gwsrv::core::register_map::RegisterMaps;
use gwsrv::core::transport::{ModbusConnectionFactory, TransportKind};
use gwsrv::runtime::{DeviceRef, GatewayContext, GatewayRegistry};

const BUS_QUEUE: usize = 64;

#[derive(Parser, Debug, Clone)]
#[command(name = "gwsrv", version, about = "Industrial IoT gateway service")]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "GWSRV_CONFIG")]
    config: PathBuf,

    /// Device roster, overrides `devices_file`
    #[arg(short, long)]
    devices: Option<PathBuf>,

    /// Log level, overrides `service.log_level`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Load config, roster and register maps, print a summary and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // ============ Phase 1: Configuration and logging ============
    let mut config = AppConfig::load(&args.config).context("Failed to load configuration")?;
    if let Some(level) = &args.log_level {
        config.service.log_level = level.clone();
    }
    if let Some(devices) = &args.devices {
        config.devices_file = Some(devices.clone());
    }

    let log_config = LogConfig {
        service_name: config.service.name.clone(),
        level: config.service.log_level.clone(),
        log_dir: config.service.log_dir.clone(),
        enable_json: config.service.log_json,
    };
    // Held for the process lifetime so the file writer flushes
    let _log_guard = logging::init_with_config(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting {} v{}", config.service.name, env!("CARGO_PKG_VERSION"));

    // ============ Phase 2: Register maps and roster ============
    let maps = RegisterMaps::load(config.register_map_dir.as_deref())
        .context("Failed to load register maps")?;
    let roster = match &config.devices_file {
        Some(path) => load_roster(path).context("Failed to load device roster")?,
        None => {
            warn!("No devices file configured, waiting for roster from the bus");
            Vec::new()
        },
    };

    if args.validate {
        print_summary(&config, &maps, &roster);
        info!("Validation completed successfully");
        return Ok(());
    }

    // ============ Phase 3: Bus and registry ============
    let (bus_tx, mut bus_rx) = mpsc::channel::<BusMessage>(BUS_QUEUE);
    let bus = Arc::new(MqttBus::start(&config, bus_tx));

    let ctx = GatewayContext::new(
        Arc::new(ModbusConnectionFactory::new(config.request_timeout())),
        maps,
        Arc::clone(&bus) as Arc<dyn SignalSink>,
        Arc::clone(&bus) as Arc<dyn StatusSink>,
        config.runtime_settings(),
    );
    let registry = GatewayRegistry::new(ctx);
    registry.reload(roster).await;

    // ============ Phase 4: Service loop ============
    let shutdown = common::shutdown::wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            },
            message = bus_rx.recv() => match message {
                Some(BusMessage::Command(envelope)) => {
                    match registry.dispatch(&envelope).await {
                        Ok(outcome) => info!(
                            "Command {:?} for {}: {:?}",
                            envelope.action, envelope.serial, outcome
                        ),
                        Err(e) => error!(
                            "Command {:?} for {} failed: {}",
                            envelope.action, envelope.serial, e
                        ),
                    }
                },
                Some(BusMessage::Roster(devices)) => {
                    info!("Roster update: {} devices", devices.len());
                    registry.reload(devices).await;
                },
                None => {
                    warn!("Bus channel closed");
                    break;
                },
            },
        }
    }

    // ============ Phase 5: Shutdown ============
    registry.shutdown().await;
    bus.stop().await;
    info!("Service shutdown complete");
    Ok(())
}

fn print_summary(config: &AppConfig, maps: &RegisterMaps, roster: &[DeviceRecord]) {
    println!("gwsrv configuration");
    println!(
        "  gateway: {}/{}",
        config.gateway.organization_id, config.gateway.gateway_id
    );
    println!("  mqtt:    {}:{}", config.mqtt.host, config.mqtt.port);
    println!(
        "  polling: {}ms, {} failures, retry {}ms",
        config.polling.interval_ms, config.polling.failure_threshold, config.reconnect.retry_delay_ms
    );
    for kind in TransportKind::ALL {
        let map = maps.for_kind(kind);
        println!(
            "  map {:<6} {} v{} ({} registers)",
            kind.as_str(),
            map.name(),
            map.version(),
            map.registers().len()
        );
    }
    println!("  devices: {}", roster.len());
    for record in roster {
        let device = DeviceRef::FromConfig(record.clone());
        let cfg = device.connection_config();
        let transports: Vec<&str> = TransportKind::ALL
            .into_iter()
            .filter(|kind| cfg.wants(*kind))
            .map(|kind| kind.as_str())
            .collect();
        println!(
            "    {} {:?} -> {}",
            device.serial(),
            device.name(),
            if transports.is_empty() { "-".to_string() } else { transports.join(", ") }
        );
    }
}
