//! Runtime tuning parameters.

use std::time::Duration;

use serde::Deserialize;

/// Timer configuration for the tuning sequence.
///
/// All three bounds come from the surrounding system (config file or
/// defaults); the core hard-codes none of them.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bounded wait for the dish rotor to settle before lock polling starts.
    pub rotor_settle_ms: u64,
    /// Interval between hardware lock polls while tuning.
    pub lock_poll_interval_ms: u64,
    /// Overall bound on the lock-polling phase; expiry without lock
    /// returns the device to idle.
    pub tuning_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            rotor_settle_ms: 15_000,
            lock_poll_interval_ms: 100,
            tuning_timeout_ms: 4_500,
        }
    }
}

impl DeviceConfig {
    pub fn rotor_settle(&self) -> Duration {
        Duration::from_millis(self.rotor_settle_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn tuning_timeout(&self) -> Duration {
        Duration::from_millis(self.tuning_timeout_ms)
    }
}
