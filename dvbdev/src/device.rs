//! Per-device readiness/tuning state machine and packet reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::filter::{PidFilter, PidFilterRegistry};
use crate::frontend::{Frontend, HardwareBackend};
use crate::types::{
    DeviceId, DeviceState, PresenceSet, ResourceRole, TransmissionTypes, Transponder,
    TuningConfig, TS_PACKET_SIZE,
};

/// Pause between stream reads when no frame is available.
const READER_IDLE_WAIT: Duration = Duration::from_millis(10);

/// State-change notification, one per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEvent {
    pub device: DeviceId,
    pub state: DeviceState,
}

/// Handle to the background packet-reader task.
struct ReaderHandle {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Mutable device state, serialized behind one mutex.
///
/// Every control-stream mutation (hot-plug, tune/stop, timer callback)
/// goes through this lock; the packet reader never takes it.
struct DeviceInner {
    presence: PresenceSet,
    paths: [Option<String>; 4],
    state: DeviceState,
    frontend: Option<Arc<dyn Frontend>>,
    frontend_name: Option<String>,
    transmission_types: TransmissionTypes,
    /// Tuning-sequence generation. Bumped whenever a sequence is
    /// superseded; timer callbacks carrying a stale generation are
    /// no-ops.
    tune_generation: u64,
    reader: Option<ReaderHandle>,
}

fn role_slot(role: ResourceRole) -> usize {
    match role {
        ResourceRole::ConditionalAccess => 0,
        ResourceRole::Demux => 1,
        ResourceRole::StreamSource => 2,
        ResourceRole::Frontend => 3,
    }
}

/// One physical tuner slot.
///
/// Composes the presence bitset, the tuning state machine and the PID
/// filter table. Created and discarded by the device manager as
/// hot-plug notifications arrive.
pub struct Device {
    id: DeviceId,
    backend: Arc<dyn HardwareBackend>,
    config: DeviceConfig,
    filters: Arc<PidFilterRegistry>,
    events: broadcast::Sender<DeviceEvent>,
    packets_delivered: Arc<AtomicU64>,
    inner: Mutex<DeviceInner>,
}

impl Device {
    pub fn new(
        id: DeviceId,
        backend: Arc<dyn HardwareBackend>,
        config: DeviceConfig,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            backend,
            config,
            filters: Arc::new(PidFilterRegistry::new()),
            events,
            packets_delivered: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(DeviceInner {
                presence: PresenceSet::default(),
                paths: [None, None, None, None],
                state: DeviceState::NotReady,
                frontend: None,
                frontend_name: None,
                transmission_types: TransmissionTypes::default(),
                tune_generation: 0,
                reader: None,
            }),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub async fn state(&self) -> DeviceState {
        self.inner.lock().await.state
    }

    /// Subscribe to state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Total TS packets delivered through the filter table.
    pub fn packets_delivered(&self) -> u64 {
        self.packets_delivered.load(Ordering::SeqCst)
    }

    /// The PID filter table for this device.
    pub fn filters(&self) -> &PidFilterRegistry {
        &self.filters
    }

    /// Register `filter` for `pid`. Cleared automatically when the
    /// device goes back to idle or not-ready.
    pub fn add_pid_filter(&self, pid: u16, filter: Arc<dyn PidFilter>) {
        self.filters.add_pid_filter(pid, filter);
    }

    pub fn remove_pid_filter(&self, pid: u16, filter: &Arc<dyn PidFilter>) {
        self.filters.remove_pid_filter(pid, filter);
    }

    /// Record a newly attached resource.
    ///
    /// Completing the mandatory set triggers identification; on success
    /// the device becomes idle. An identification failure leaves the
    /// device not-ready until the next attach notification retries it.
    pub async fn component_added(&self, role: ResourceRole, path: &str) {
        let mut inner = self.inner.lock().await;
        debug!("{}: {:?} attached at {}", self.id, role, path);
        inner.paths[role_slot(role)] = Some(path.to_owned());
        inner.presence.insert(role);

        if inner.presence.is_mandatory_complete() && inner.state == DeviceState::NotReady {
            self.identify(&mut inner);
        }
    }

    /// Record a detached resource.
    ///
    /// Losing a mandatory resource cancels any in-flight tuning, clears
    /// the filter table and forces the device back to not-ready.
    /// Returns whether the presence set is now empty, signalling the
    /// owner to discard this device.
    pub async fn component_removed(&self, role: ResourceRole) -> bool {
        let mut inner = self.inner.lock().await;
        debug!("{}: {:?} detached", self.id, role);
        inner.paths[role_slot(role)] = None;
        inner.presence.remove(role);

        if role.is_mandatory() && inner.state != DeviceState::NotReady {
            self.teardown(&mut inner, DeviceState::NotReady).await;
        }
        inner.presence.is_empty()
    }

    /// Start a tuning sequence for `transponder`.
    ///
    /// Valid from idle or tuned (retune), and from mid-sequence states,
    /// in which case the running sequence is superseded: its pending
    /// timers are disarmed before anything else happens.
    pub async fn tune_device(
        self: &Arc<Self>,
        transponder: Transponder,
        config: TuningConfig,
    ) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        if inner.state == DeviceState::NotReady {
            return Err(DeviceError::NotReady);
        }

        // Invalidate the previous sequence before touching anything else
        inner.tune_generation += 1;
        let generation = inner.tune_generation;
        self.stop_reader(&mut inner).await;

        let frontend = match inner.frontend.clone() {
            Some(frontend) => frontend,
            None => return Err(DeviceError::NotReady),
        };

        info!(
            "{}: tuning to {:?} transponder{}",
            self.id,
            transponder.transmission_type,
            if config.needs_rotor { " (rotor move)" } else { "" }
        );

        if let Err(e) = frontend.tune(&transponder, &config) {
            warn!("{}: tune command failed: {}", self.id, e);
            self.filters.clear();
            self.set_state(&mut inner, DeviceState::Idle);
            return Err(e.into());
        }

        let needs_rotor = config.needs_rotor;
        if needs_rotor {
            self.set_state(&mut inner, DeviceState::RotorMoving);
        } else {
            self.set_state(&mut inner, DeviceState::Tuning);
            if let Err(e) = self.start_reader(&mut inner) {
                warn!("{}: cannot start packet reader: {}", self.id, e);
                self.teardown(&mut inner, DeviceState::Idle).await;
                return Err(e);
            }
        }
        drop(inner);

        let device = Arc::clone(self);
        tokio::spawn(async move {
            device.run_tune_sequence(generation, needs_rotor, frontend).await;
        });
        Ok(())
    }

    /// Cancel any tuning sequence, stop packet reading and force idle.
    ///
    /// No-op when already idle; the reader is fully joined before this
    /// returns. Also a no-op while not-ready, which must not be
    /// promoted to idle.
    pub async fn stop_device(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            DeviceState::NotReady | DeviceState::Idle => {}
            _ => self.teardown(&mut inner, DeviceState::Idle).await,
        }
    }

    /// Signal strength scaled to 0-100.
    ///
    /// # Panics
    ///
    /// The device must be tuning or tuned; anything else is a caller
    /// bug.
    pub async fn get_signal(&self) -> Result<u8, DeviceError> {
        let inner = self.inner.lock().await;
        let frontend = self.tuning_frontend(&inner, "get_signal");
        let status = frontend.status()?;
        Ok(frontend.signal_scale().scale(status.signal_raw))
    }

    /// Signal-to-noise ratio scaled to 0-100.
    ///
    /// # Panics
    ///
    /// The device must be tuning or tuned; anything else is a caller
    /// bug.
    pub async fn get_snr(&self) -> Result<u8, DeviceError> {
        let inner = self.inner.lock().await;
        let frontend = self.tuning_frontend(&inner, "get_snr");
        let status = frontend.status()?;
        Ok(frontend.signal_scale().scale(status.snr_raw))
    }

    /// Live hardware lock bit, as opposed to the state machine's own
    /// bookkeeping.
    ///
    /// # Panics
    ///
    /// The device must not be not-ready.
    pub async fn is_tuned(&self) -> Result<bool, DeviceError> {
        let inner = self.inner.lock().await;
        let frontend = match (&inner.frontend, inner.state) {
            (Some(frontend), state) if state != DeviceState::NotReady => Arc::clone(frontend),
            _ => panic!("is_tuned called on not-ready {}", self.id),
        };
        Ok(frontend.status()?.has_lock)
    }

    /// Standards the frontend supports, fixed at identification.
    ///
    /// # Panics
    ///
    /// The device must not be not-ready.
    pub async fn transmission_types(&self) -> TransmissionTypes {
        let inner = self.inner.lock().await;
        assert!(
            inner.state != DeviceState::NotReady,
            "transmission_types called on not-ready {}",
            self.id
        );
        inner.transmission_types
    }

    /// Frontend model name from identification.
    ///
    /// # Panics
    ///
    /// The device must not be not-ready.
    pub async fn frontend_name(&self) -> String {
        let inner = self.inner.lock().await;
        match (&inner.frontend_name, inner.state) {
            (Some(name), state) if state != DeviceState::NotReady => name.clone(),
            _ => panic!("frontend_name called on not-ready {}", self.id),
        }
    }

    fn tuning_frontend(&self, inner: &DeviceInner, what: &str) -> Arc<dyn Frontend> {
        match (inner.frontend.clone(), inner.state) {
            (Some(frontend), DeviceState::Tuning | DeviceState::Tuned) => frontend,
            (_, state) => panic!("{what} called on {} in state {state:?}", self.id),
        }
    }

    /// Open and query the frontend. Only called with the mandatory set
    /// complete and the device not-ready.
    fn identify(&self, inner: &mut DeviceInner) {
        let Some(path) = inner.paths[role_slot(ResourceRole::Frontend)].clone() else {
            warn!("{}: mandatory-complete but no frontend path", self.id);
            return;
        };

        let frontend = match self.backend.open_frontend(&path) {
            Ok(frontend) => frontend,
            Err(e) => {
                warn!("{}: cannot open frontend {}: {}", self.id, path, e);
                return;
            }
        };
        let info = match frontend.identify() {
            Ok(info) => info,
            Err(e) => {
                warn!("{}: identification failed: {}", self.id, e);
                return;
            }
        };

        info!(
            "{}: identified \"{}\" ({} standard(s))",
            self.id,
            info.name,
            info.transmission_types.iter().count()
        );
        inner.frontend = Some(frontend);
        inner.frontend_name = Some(info.name);
        inner.transmission_types = info.transmission_types;
        self.set_state(inner, DeviceState::Idle);
    }

    /// Timer-driven part of one tuning sequence. Every step re-checks
    /// the generation under the control lock, so a superseded sequence
    /// dies silently no matter when its timers fire.
    async fn run_tune_sequence(
        self: Arc<Self>,
        generation: u64,
        needs_rotor: bool,
        frontend: Arc<dyn Frontend>,
    ) {
        if needs_rotor {
            tokio::time::sleep(self.config.rotor_settle()).await;
            let mut inner = self.inner.lock().await;
            if inner.tune_generation != generation {
                trace!("{}: stale rotor-settle timer", self.id);
                return;
            }
            self.set_state(&mut inner, DeviceState::Tuning);
            if let Err(e) = self.start_reader(&mut inner) {
                warn!("{}: cannot start packet reader: {}", self.id, e);
                self.teardown(&mut inner, DeviceState::Idle).await;
                return;
            }
        }

        let deadline = Instant::now() + self.config.tuning_timeout();
        loop {
            tokio::time::sleep(self.config.lock_poll_interval()).await;
            let mut inner = self.inner.lock().await;
            if inner.tune_generation != generation {
                trace!("{}: stale lock-poll timer", self.id);
                return;
            }

            match frontend.status() {
                Ok(status) if status.has_lock => {
                    info!("{}: frontend locked", self.id);
                    self.set_state(&mut inner, DeviceState::Tuned);
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!("{}: lock poll failed: {}", self.id, e),
            }

            if Instant::now() >= deadline {
                info!("{}: no lock within timeout, giving up", self.id);
                self.teardown(&mut inner, DeviceState::Idle).await;
                return;
            }
        }
    }

    /// Spawn the background packet reader for the stream-source
    /// resource. Runs until stopped or the stream ends, never touching
    /// the control lock.
    ///
    /// Reader death (end of stream, read failure) is logged but not
    /// observed by the state machine: the device keeps its state until
    /// stopped or retuned.
    fn start_reader(&self, inner: &mut DeviceInner) -> Result<(), DeviceError> {
        let Some(path) = inner.paths[role_slot(ResourceRole::StreamSource)].clone() else {
            return Err(DeviceError::NotReady);
        };
        let mut stream = self.backend.open_stream(&path)?;

        let running = Arc::new(AtomicBool::new(true));
        let reader_running = Arc::clone(&running);
        let filters = Arc::clone(&self.filters);
        let packets = Arc::clone(&self.packets_delivered);
        let id = self.id;

        let handle = tokio::spawn(async move {
            let mut frame = [0u8; TS_PACKET_SIZE];
            while reader_running.load(Ordering::SeqCst) {
                match stream.read_frame(&mut frame) {
                    Ok(0) => {
                        warn!("{}: stream ended while device active", id);
                        break;
                    }
                    Ok(n) if n == TS_PACKET_SIZE => {
                        if filters.dispatch(&frame) {
                            packets.fetch_add(1, Ordering::SeqCst);
                        }
                        // Keep other tasks runnable under a saturated stream
                        tokio::task::yield_now().await;
                    }
                    Ok(n) => warn!("{}: short frame ({} bytes), skipping", id, n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        tokio::time::sleep(READER_IDLE_WAIT).await;
                    }
                    Err(e) => {
                        error!("{}: stream read failed: {}", id, e);
                        break;
                    }
                }
            }
            reader_running.store(false, Ordering::SeqCst);
            debug!("{}: packet reader stopped", id);
        });

        inner.reader = Some(ReaderHandle { running, handle });
        Ok(())
    }

    /// Stop the packet reader and wait until it has ceased reading.
    async fn stop_reader(&self, inner: &mut DeviceInner) {
        if let Some(reader) = inner.reader.take() {
            reader.running.store(false, Ordering::SeqCst);
            if let Err(e) = reader.handle.await {
                warn!("{}: reader task join failed: {}", self.id, e);
            }
        }
    }

    /// Common exit path: invalidate the running sequence, stop the
    /// reader, drop all filter registrations and land in `target`.
    async fn teardown(&self, inner: &mut DeviceInner, target: DeviceState) {
        inner.tune_generation += 1;
        self.stop_reader(inner).await;
        self.filters.clear();
        if target == DeviceState::NotReady {
            inner.frontend = None;
            inner.frontend_name = None;
            inner.transmission_types = TransmissionTypes::default();
        }
        self.set_state(inner, target);
    }

    fn set_state(&self, inner: &mut DeviceInner, new: DeviceState) {
        if inner.state == new {
            return;
        }
        debug!("{}: {:?} -> {:?}", self.id, inner.state, new);
        inner.state = new;
        let _ = self.events.send(DeviceEvent {
            device: self.id,
            state: new,
        });
    }
}
