//! Hot-pluggable broadcast tuner device management.
//!
//! This crate tracks physical tuner hardware (satellite, cable,
//! terrestrial, ATSC) exposed to the process as dynamically
//! appearing/disappearing resources, and provides:
//! - [`Device`]: per-slot readiness/tuning state machine with a
//!   timer-driven tune/lock sequence and a background packet reader
//! - [`PidFilterRegistry`]: PID-based stream-filter subscription and
//!   dispatch
//! - [`DeviceManager`]: hot-plug routing and device lifecycle
//! - [`sim`]: deterministic in-memory hardware for tests and demos
//!
//! Hardware access, hot-plug delivery and tuning-parameter encoding
//! stay behind the [`HardwareBackend`] and [`HotplugResolver`] traits.

pub mod config;
pub mod device;
pub mod error;
pub mod filter;
pub mod frontend;
pub mod manager;
pub mod sim;
pub mod types;

pub use config::DeviceConfig;
pub use device::{Device, DeviceEvent};
pub use error::DeviceError;
pub use filter::{PidFilter, PidFilterRegistry};
pub use frontend::{
    Frontend, FrontendInfo, FrontendStatus, HardwareBackend, LinearScale, SignalScale, TsStream,
};
pub use manager::{DeviceManager, HotplugEvent, HotplugResolver, ResolvedComponent};
pub use types::{
    DeviceId, DeviceState, PresenceSet, ResourceRole, TransmissionType, TransmissionTypes,
    Transponder, TuningConfig, MAX_PID, TS_PACKET_SIZE,
};
