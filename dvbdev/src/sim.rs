//! Deterministic in-memory hardware.
//!
//! Everything the core needs from real hardware (frontends, stream
//! sources, hot-plug resolution) with knobs instead of ioctls: tests
//! and the simulator harness flip lock bits and push frames by hand.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use crate::frontend::{
    Frontend, FrontendInfo, FrontendStatus, HardwareBackend, LinearScale, SignalScale, TsStream,
};
use crate::manager::{HotplugResolver, ResolvedComponent};
use crate::types::{
    DeviceId, ResourceRole, TransmissionTypes, Transponder, TuningConfig, SYNC_BYTE,
    TS_PACKET_SIZE,
};

/// Build a minimal TS frame carrying `pid` and a payload counter byte.
pub fn ts_packet(pid: u16, counter: u8) -> [u8; TS_PACKET_SIZE] {
    let mut frame = [0xFFu8; TS_PACKET_SIZE];
    frame[0] = SYNC_BYTE;
    frame[1] = (pid >> 8) as u8 & 0x1F;
    frame[2] = pid as u8;
    frame[3] = 0x10 | (counter & 0x0F);
    frame
}

/// Scriptable frontend: lock/signal/SNR are plain atomics.
pub struct SimFrontend {
    name: String,
    transmission_types: TransmissionTypes,
    scale: LinearScale,
    fail_identify: AtomicBool,
    has_lock: AtomicBool,
    signal_raw: AtomicU16,
    snr_raw: AtomicU16,
    last_tune: Mutex<Option<(Transponder, TuningConfig)>>,
}

impl SimFrontend {
    pub fn new(name: &str, transmission_types: TransmissionTypes) -> Arc<Self> {
        Self::with_scale(name, transmission_types, LinearScale { max_raw: u16::MAX })
    }

    pub fn with_scale(
        name: &str,
        transmission_types: TransmissionTypes,
        scale: LinearScale,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            transmission_types,
            scale,
            fail_identify: AtomicBool::new(false),
            has_lock: AtomicBool::new(false),
            signal_raw: AtomicU16::new(0),
            snr_raw: AtomicU16::new(0),
            last_tune: Mutex::new(None),
        })
    }

    pub fn set_fail_identify(&self, fail: bool) {
        self.fail_identify.store(fail, Ordering::SeqCst);
    }

    pub fn set_lock(&self, locked: bool) {
        self.has_lock.store(locked, Ordering::SeqCst);
    }

    pub fn set_signal_raw(&self, raw: u16) {
        self.signal_raw.store(raw, Ordering::SeqCst);
    }

    pub fn set_snr_raw(&self, raw: u16) {
        self.snr_raw.store(raw, Ordering::SeqCst);
    }

    /// Last (transponder, config) pair a tune command carried.
    pub fn last_tune(&self) -> Option<(Transponder, TuningConfig)> {
        self.last_tune.lock().unwrap().clone()
    }
}

impl Frontend for SimFrontend {
    fn identify(&self) -> io::Result<FrontendInfo> {
        if self.fail_identify.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "simulated identification failure",
            ));
        }
        Ok(FrontendInfo {
            name: self.name.clone(),
            transmission_types: self.transmission_types,
        })
    }

    fn tune(&self, transponder: &Transponder, config: &TuningConfig) -> io::Result<()> {
        *self.last_tune.lock().unwrap() = Some((transponder.clone(), config.clone()));
        Ok(())
    }

    fn status(&self) -> io::Result<FrontendStatus> {
        Ok(FrontendStatus {
            has_lock: self.has_lock.load(Ordering::SeqCst),
            signal_raw: self.signal_raw.load(Ordering::SeqCst),
            snr_raw: self.snr_raw.load(Ordering::SeqCst),
        })
    }

    fn signal_scale(&self) -> &dyn SignalScale {
        &self.scale
    }
}

struct SimStreamInner {
    queue: Mutex<VecDeque<[u8; TS_PACKET_SIZE]>>,
    eof: AtomicBool,
}

/// Producer handle for one simulated stream source. Cloneable; the
/// opened [`TsStream`] reads from the same queue.
#[derive(Clone)]
pub struct SimStreamHandle {
    inner: Arc<SimStreamInner>,
}

impl SimStreamHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimStreamInner {
                queue: Mutex::new(VecDeque::new()),
                eof: AtomicBool::new(false),
            }),
        }
    }

    pub fn push_frame(&self, frame: [u8; TS_PACKET_SIZE]) {
        self.inner.queue.lock().unwrap().push_back(frame);
    }

    pub fn push_packet(&self, pid: u16, counter: u8) {
        self.push_frame(ts_packet(pid, counter));
    }

    /// Mark end of stream once the queue drains.
    pub fn finish(&self) {
        self.inner.eof.store(true, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

impl Default for SimStreamHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct SimTsStream {
    inner: Arc<SimStreamInner>,
}

impl TsStream for SimTsStream {
    fn read_frame(&mut self, frame: &mut [u8; TS_PACKET_SIZE]) -> io::Result<usize> {
        if let Some(next) = self.inner.queue.lock().unwrap().pop_front() {
            *frame = next;
            return Ok(TS_PACKET_SIZE);
        }
        if self.inner.eof.load(Ordering::SeqCst) {
            return Ok(0);
        }
        Err(io::Error::new(io::ErrorKind::WouldBlock, "no frame queued"))
    }
}

/// In-memory [`HardwareBackend`]: frontends and streams are installed
/// under the paths the resolver will later hand out.
#[derive(Default)]
pub struct SimBackend {
    frontends: Mutex<HashMap<String, Arc<SimFrontend>>>,
    streams: Mutex<HashMap<String, SimStreamHandle>>,
}

impl SimBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install_frontend(&self, path: &str, frontend: Arc<SimFrontend>) {
        self.frontends
            .lock()
            .unwrap()
            .insert(path.to_owned(), frontend);
    }

    /// Install a stream source and return the producer handle.
    pub fn install_stream(&self, path: &str) -> SimStreamHandle {
        let handle = SimStreamHandle::new();
        self.streams
            .lock()
            .unwrap()
            .insert(path.to_owned(), handle.clone());
        handle
    }
}

impl HardwareBackend for SimBackend {
    fn open_frontend(&self, path: &str) -> io::Result<Arc<dyn Frontend>> {
        self.frontends
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .map(|f| f as Arc<dyn Frontend>)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no frontend at {path}")))
    }

    fn open_stream(&self, path: &str) -> io::Result<Box<dyn TsStream>> {
        self.streams
            .lock()
            .unwrap()
            .get(path)
            .map(|handle| {
                Box::new(SimTsStream {
                    inner: Arc::clone(&handle.inner),
                }) as Box<dyn TsStream>
            })
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no stream at {path}")))
    }
}

/// Table-backed hot-plug resolver.
#[derive(Default)]
pub struct TableResolver {
    table: Mutex<HashMap<String, ResolvedComponent>>,
}

impl TableResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, external_id: &str, device: DeviceId, role: ResourceRole, path: &str) {
        self.table.lock().unwrap().insert(
            external_id.to_owned(),
            ResolvedComponent {
                device,
                role,
                path: path.to_owned(),
            },
        );
    }
}

impl HotplugResolver for TableResolver {
    fn resolve(&self, external_id: &str) -> Option<ResolvedComponent> {
        self.table.lock().unwrap().get(external_id).cloned()
    }
}
