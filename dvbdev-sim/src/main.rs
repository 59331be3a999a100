//! dvbdev-sim: simulation harness for the tuner management core.
//!
//! Spins up simulated tuner slots, hot-plugs their resources through
//! the device manager, tunes the first slot and streams synthetic TS
//! packets through a PID filter until interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use log::{info, warn};
use tokio::sync::mpsc;

use dvbdev::sim::{SimBackend, SimFrontend, SimStreamHandle, TableResolver};
use dvbdev::{
    DeviceConfig, DeviceId, DeviceManager, DeviceState, HotplugEvent, PidFilter, ResourceRole,
    TransmissionType, Transponder, TuningConfig, TS_PACKET_SIZE,
};

mod logging;

/// PID carrying the synthetic payload stream.
const DEMO_PID: u16 = 0x100;

/// dvbdev-sim - simulated tuner slots driven through the real core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated tuner slots
    #[arg(short, long, default_value = "2")]
    devices: u32,

    /// Simulate a dish-rotor move on the first tune
    #[arg(long)]
    rotor: bool,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    device: Option<DeviceConfig>,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Counts packets on its PID and announces the first one.
struct PacketCounter {
    seen: AtomicU64,
}

impl PidFilter for PacketCounter {
    fn process_packet(&self, _packet: &[u8; TS_PACKET_SIZE]) {
        if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
            info!("first payload packet arrived on pid {:#06x}", DEMO_PID);
        }
    }
}

/// One simulated slot: resources installed in the backend and their
/// external identifiers registered with the resolver.
fn install_slot(
    backend: &SimBackend,
    resolver: &TableResolver,
    id: u32,
) -> (Arc<SimFrontend>, SimStreamHandle) {
    let types = [
        TransmissionType::Satellite,
        TransmissionType::Terrestrial,
    ]
    .into_iter()
    .collect();
    let frontend = SimFrontend::new(&format!("SIM-STV0299/{id}"), types);

    let fe_path = format!("/dev/dvb{id}.frontend0");
    let dvr_path = format!("/dev/dvb{id}.dvr0");
    backend.install_frontend(&fe_path, Arc::clone(&frontend));
    let stream = backend.install_stream(&dvr_path);

    let device = DeviceId(id);
    resolver.insert(&format!("udi-{id}-frontend"), device, ResourceRole::Frontend, &fe_path);
    resolver.insert(
        &format!("udi-{id}-demux"),
        device,
        ResourceRole::Demux,
        &format!("/dev/dvb{id}.demux0"),
    );
    resolver.insert(&format!("udi-{id}-dvr"), device, ResourceRole::StreamSource, &dvr_path);
    (frontend, stream)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => load_config(path)?,
        None => ConfigFile::default(),
    };
    let device_config = file_config.device.unwrap_or_default();
    let log_dir = file_config
        .logging
        .log_dir
        .map(PathBuf::from)
        .unwrap_or(args.log_dir);
    let retention = file_config
        .logging
        .retention_days
        .unwrap_or(args.log_retention_days);

    logging::init_logging(&log_dir, retention, args.verbose)?;
    info!("dvbdev-sim starting with {} simulated slot(s)", args.devices);

    let backend = SimBackend::new();
    let resolver = TableResolver::new();
    let mut slots = Vec::new();
    for id in 0..args.devices {
        slots.push(install_slot(&backend, &resolver, id));
    }

    let manager = DeviceManager::new(backend, resolver, device_config);

    // Log every state transition the core emits
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("{}: state -> {:?}", event.device, event.state);
        }
    });

    // Hot-plug all resources through the event pump
    let (hotplug_tx, hotplug_rx) = mpsc::channel(32);
    tokio::spawn(Arc::clone(&manager).run(hotplug_rx));
    for id in 0..args.devices {
        for kind in ["frontend", "demux", "dvr"] {
            hotplug_tx
                .send(HotplugEvent::Added(format!("udi-{id}-{kind}")))
                .await?;
        }
    }

    // Wait for the first slot to identify and become idle
    let device = loop {
        if let Some(device) = manager.get_device(DeviceId(0)).await {
            if device.state().await == DeviceState::Idle {
                break device;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    info!(
        "{} ready: \"{}\"",
        device.id(),
        device.frontend_name().await
    );

    let counter = Arc::new(PacketCounter {
        seen: AtomicU64::new(0),
    });
    device.add_pid_filter(DEMO_PID, Arc::clone(&counter) as _);

    device
        .tune_device(
            Transponder {
                transmission_type: TransmissionType::Satellite,
                raw: Bytes::from_static(b"freq=12551500;sr=22000"),
            },
            TuningConfig {
                needs_rotor: args.rotor,
                raw: Bytes::new(),
            },
        )
        .await?;

    // Hardware side of the script: lock shows up shortly after the tune
    // command, then frames trickle in forever.
    let (frontend, stream) = slots[0].clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        frontend.set_signal_raw(48_000);
        frontend.set_snr_raw(39_000);
        frontend.set_lock(true);
        let mut continuity = 0u8;
        loop {
            for _ in 0..64 {
                stream.push_packet(DEMO_PID, continuity);
                continuity = continuity.wrapping_add(1);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    });

    info!("running, press ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {
                match device.state().await {
                    DeviceState::Tuned => info!(
                        "signal {}%, snr {}%, {} packets delivered",
                        device.get_signal().await?,
                        device.get_snr().await?,
                        device.packets_delivered()
                    ),
                    state => warn!("{}: still {:?}", device.id(), state),
                }
            }
        }
    }

    info!("shutting down");
    device.stop_device().await;
    Ok(())
}
