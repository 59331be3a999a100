//! Hardware collaborator traits.
//!
//! The core never touches ioctls or device nodes directly. Everything
//! below the "given path + role, return a handle or a failure" line is
//! delegated to a [`HardwareBackend`] implementation; tests and the
//! simulator inject deterministic ones.

use std::io;
use std::sync::Arc;

use crate::types::{TransmissionTypes, Transponder, TuningConfig, TS_PACKET_SIZE};

/// Result of identifying a frontend.
#[derive(Debug, Clone)]
pub struct FrontendInfo {
    /// Hardware model name, e.g. "STV0299/TSA5059".
    pub name: String,
    /// Standards this frontend can demodulate.
    pub transmission_types: TransmissionTypes,
}

/// Instantaneous hardware readings.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrontendStatus {
    /// Demodulator lock bit.
    pub has_lock: bool,
    /// Raw signal strength in the hardware's own range.
    pub signal_raw: u16,
    /// Raw signal-to-noise reading in the hardware's own range.
    pub snr_raw: u16,
}

/// Maps raw hardware readings onto the 0-100 scale the core exposes.
///
/// The exact formula is hardware-dependent; frontends override the
/// default linear clamp when their driver reports something else.
pub trait SignalScale: Send + Sync {
    fn scale(&self, raw: u16) -> u8;
}

/// Linear clamp over `0..=max_raw`.
#[derive(Debug, Clone, Copy)]
pub struct LinearScale {
    pub max_raw: u16,
}

impl SignalScale for LinearScale {
    fn scale(&self, raw: u16) -> u8 {
        if self.max_raw == 0 {
            return 0;
        }
        let scaled = raw as u32 * 100 / self.max_raw as u32;
        scaled.min(100) as u8
    }
}

/// Default scale covering the full 16-bit range most drivers report.
pub(crate) static FULL_RANGE_LINEAR: LinearScale = LinearScale { max_raw: u16::MAX };

/// One opened demodulator frontend.
pub trait Frontend: Send + Sync {
    /// Query hardware model name and supported standards.
    fn identify(&self) -> io::Result<FrontendInfo>;

    /// Send one tune command. Lock acquisition is observed separately
    /// through [`Frontend::status`].
    fn tune(&self, transponder: &Transponder, config: &TuningConfig) -> io::Result<()>;

    /// Read the current lock/signal/SNR readings.
    fn status(&self) -> io::Result<FrontendStatus>;

    /// Normalization strategy for this hardware's raw readings.
    fn signal_scale(&self) -> &dyn SignalScale {
        &FULL_RANGE_LINEAR
    }
}

impl std::fmt::Debug for dyn Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Frontend")
    }
}

/// One opened transport-stream source.
///
/// Reads never park the caller: implementations return `WouldBlock`
/// when no frame is available, so the reader loop can pace itself and
/// observe its stop flag.
pub trait TsStream: Send {
    /// Read one 188-byte frame. `Ok(0)` means end of stream,
    /// `Ok(TS_PACKET_SIZE)` a complete frame.
    fn read_frame(&mut self, frame: &mut [u8; TS_PACKET_SIZE]) -> io::Result<usize>;
}

/// Factory for hardware resource handles.
pub trait HardwareBackend: Send + Sync {
    /// Open the frontend resource at `path`.
    fn open_frontend(&self, path: &str) -> io::Result<Arc<dyn Frontend>>;

    /// Open the transport-stream source at `path`.
    fn open_stream(&self, path: &str) -> io::Result<Box<dyn TsStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_scale_clamps() {
        let scale = LinearScale { max_raw: 200 };
        assert_eq!(scale.scale(0), 0);
        assert_eq!(scale.scale(100), 50);
        assert_eq!(scale.scale(200), 100);
        // Readings above the declared range clamp instead of overflowing
        assert_eq!(scale.scale(400), 100);
    }

    #[test]
    fn test_full_range_default() {
        assert_eq!(FULL_RANGE_LINEAR.scale(u16::MAX), 100);
        assert_eq!(FULL_RANGE_LINEAR.scale(u16::MAX / 2), 49);
        assert_eq!(FULL_RANGE_LINEAR.scale(0), 0);
    }
}
