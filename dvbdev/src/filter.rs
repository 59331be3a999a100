//! PID filter registration and packet dispatch.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use log::{error, trace, warn};

use crate::types::{packet_pid, MAX_PID, TS_PACKET_SIZE};

/// A packet-consuming capability.
///
/// One instance may be registered under many PIDs; a PID may carry many
/// distinct instances. Invocations happen on the packet-reader activity,
/// never on the control stream.
pub trait PidFilter: Send + Sync {
    fn process_packet(&self, packet: &[u8; TS_PACKET_SIZE]);
}

/// Per-device mapping from PID to an ordered set of filters.
///
/// The table is mutated from the control stream and read from the
/// dispatch stream; a reader/writer lock keeps the two honest. Because
/// dispatch runs under the read lock, `remove_pid_filter` returning
/// guarantees the filter will not be invoked again.
pub struct PidFilterRegistry {
    table: RwLock<HashMap<u16, Vec<Arc<dyn PidFilter>>>>,
}

impl PidFilterRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Register `filter` for `pid`, appended after existing filters.
    ///
    /// Re-adding an already-registered (pid, filter) pair is a no-op.
    /// Identity is instance identity: the same `Arc` counts as the same
    /// filter.
    pub fn add_pid_filter(&self, pid: u16, filter: Arc<dyn PidFilter>) {
        assert!(pid <= MAX_PID, "pid {pid:#06x} out of 13-bit range");

        let mut table = self.table.write().unwrap();
        let filters = table.entry(pid).or_default();
        if filters.iter().any(|f| Arc::ptr_eq(f, &filter)) {
            trace!("filter already registered for pid {pid:#06x}");
            return;
        }
        filters.push(filter);
    }

    /// Unregister `filter` from `pid`. Unknown pairs are ignored.
    pub fn remove_pid_filter(&self, pid: u16, filter: &Arc<dyn PidFilter>) {
        assert!(pid <= MAX_PID, "pid {pid:#06x} out of 13-bit range");

        let mut table = self.table.write().unwrap();
        if let Some(filters) = table.get_mut(&pid) {
            filters.retain(|f| !Arc::ptr_eq(f, filter));
            if filters.is_empty() {
                table.remove(&pid);
            }
        }
    }

    /// Deliver one frame to every filter registered for its PID, in
    /// registration order. Frames for PIDs with no filters go nowhere.
    /// Returns whether the frame carried a valid sync byte; unsynced
    /// frames are dropped and return `false`.
    ///
    /// A panicking filter does not abort delivery to the filters behind
    /// it; the failure is logged and dispatch continues.
    pub fn dispatch(&self, packet: &[u8; TS_PACKET_SIZE]) -> bool {
        let pid = match packet_pid(packet) {
            Some(pid) => pid,
            None => {
                warn!("dropping unsynced frame");
                return false;
            }
        };

        let table = self.table.read().unwrap();
        let Some(filters) = table.get(&pid) else {
            return true;
        };
        for filter in filters {
            let result = catch_unwind(AssertUnwindSafe(|| filter.process_packet(packet)));
            if result.is_err() {
                error!("filter for pid {pid:#06x} panicked, continuing dispatch");
            }
        }
        true
    }

    /// Drop every registration. Called on stop/teardown so consumers
    /// never have to unregister explicitly.
    pub fn clear(&self) {
        self.table.write().unwrap().clear();
    }

    /// Number of filters currently registered for `pid`.
    pub fn filter_count(&self, pid: u16) -> usize {
        self.table
            .read()
            .unwrap()
            .get(&pid)
            .map_or(0, |filters| filters.len())
    }

    /// Whether any filter is registered at all.
    pub fn is_empty(&self) -> bool {
        self.table.read().unwrap().is_empty()
    }
}

impl Default for PidFilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::types::SYNC_BYTE;

    fn packet_for(pid: u16) -> [u8; TS_PACKET_SIZE] {
        let mut packet = [0xFFu8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = (pid >> 8) as u8 & 0x1F;
        packet[2] = pid as u8;
        packet
    }

    struct CountingFilter {
        hits: AtomicUsize,
    }

    impl CountingFilter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl PidFilter for CountingFilter {
        fn process_packet(&self, _packet: &[u8; TS_PACKET_SIZE]) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TaggingFilter {
        tag: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl PidFilter for TaggingFilter {
        fn process_packet(&self, _packet: &[u8; TS_PACKET_SIZE]) {
            self.order.lock().unwrap().push(self.tag);
        }
    }

    struct PanickingFilter;

    impl PidFilter for PanickingFilter {
        fn process_packet(&self, _packet: &[u8; TS_PACKET_SIZE]) {
            panic!("broken consumer");
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = PidFilterRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let a: Arc<dyn PidFilter> = Arc::new(TaggingFilter {
            tag: "a",
            order: Arc::clone(&order),
        });
        let b: Arc<dyn PidFilter> = Arc::new(TaggingFilter {
            tag: "b",
            order: Arc::clone(&order),
        });

        registry.add_pid_filter(0x100, Arc::clone(&a));
        registry.add_pid_filter(0x100, Arc::clone(&b));

        registry.dispatch(&packet_for(0x100));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);

        registry.remove_pid_filter(0x100, &a);
        registry.dispatch(&packet_for(0x100));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "b"]);
    }

    #[test]
    fn test_readd_is_noop() {
        let registry = PidFilterRegistry::new();
        let filter = CountingFilter::new();
        let dyn_filter: Arc<dyn PidFilter> = filter.clone();

        registry.add_pid_filter(0x20, Arc::clone(&dyn_filter));
        registry.add_pid_filter(0x20, Arc::clone(&dyn_filter));
        assert_eq!(registry.filter_count(0x20), 1);

        registry.dispatch(&packet_for(0x20));
        assert_eq!(filter.hits(), 1);
    }

    #[test]
    fn test_same_filter_multiple_pids() {
        let registry = PidFilterRegistry::new();
        let filter = CountingFilter::new();
        let dyn_filter: Arc<dyn PidFilter> = filter.clone();

        registry.add_pid_filter(0x10, Arc::clone(&dyn_filter));
        registry.add_pid_filter(0x11, Arc::clone(&dyn_filter));

        registry.dispatch(&packet_for(0x10));
        registry.dispatch(&packet_for(0x11));
        // Untouched pid
        registry.dispatch(&packet_for(0x12));
        assert_eq!(filter.hits(), 2);
    }

    #[test]
    fn test_panicking_filter_does_not_abort_dispatch() {
        let registry = PidFilterRegistry::new();
        let broken: Arc<dyn PidFilter> = Arc::new(PanickingFilter);
        let counter = CountingFilter::new();

        registry.add_pid_filter(0x30, broken);
        registry.add_pid_filter(0x30, counter.clone());

        registry.dispatch(&packet_for(0x30));
        assert_eq!(counter.hits(), 1);
    }

    #[test]
    fn test_unsynced_frame_dropped() {
        let registry = PidFilterRegistry::new();
        let counter = CountingFilter::new();
        registry.add_pid_filter(0, counter.clone());

        let mut packet = packet_for(0);
        packet[0] = 0x00;
        assert!(!registry.dispatch(&packet));
        assert_eq!(counter.hits(), 0);

        assert!(registry.dispatch(&packet_for(0)));
        // Valid header, no filters: delivered to the table, consumed by nobody
        assert!(registry.dispatch(&packet_for(1)));
    }

    #[test]
    fn test_clear() {
        let registry = PidFilterRegistry::new();
        registry.add_pid_filter(0x100, CountingFilter::new());
        registry.add_pid_filter(0x101, CountingFilter::new());
        assert!(!registry.is_empty());

        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.filter_count(0x100), 0);
    }

    /// Parks inside `process_packet` until released, so a dispatch pass
    /// can be held open from the outside.
    struct ParkingFilter {
        entered: mpsc::Sender<()>,
        release: Mutex<mpsc::Receiver<()>>,
        hits: AtomicUsize,
    }

    impl PidFilter for ParkingFilter {
        fn process_packet(&self, _packet: &[u8; TS_PACKET_SIZE]) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
    }

    #[test]
    fn test_remove_waits_for_inflight_dispatch() {
        let registry = Arc::new(PidFilterRegistry::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let parked = Arc::new(ParkingFilter {
            entered: entered_tx,
            release: Mutex::new(release_rx),
            hits: AtomicUsize::new(0),
        });
        let trailing = CountingFilter::new();

        let parked_dyn: Arc<dyn PidFilter> = parked.clone();
        registry.add_pid_filter(0x40, Arc::clone(&parked_dyn));
        registry.add_pid_filter(0x40, trailing.clone());

        let dispatcher = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.dispatch(&packet_for(0x40)))
        };
        // The pass is now inside the parked filter
        entered_rx.recv().unwrap();

        let remove_returned = Arc::new(AtomicBool::new(false));
        let remover = {
            let registry = Arc::clone(&registry);
            let remove_returned = Arc::clone(&remove_returned);
            let filter = Arc::clone(&parked_dyn);
            thread::spawn(move || {
                registry.remove_pid_filter(0x40, &filter);
                remove_returned.store(true, Ordering::SeqCst);
            })
        };

        // Removal must block behind the in-flight pass
        thread::sleep(Duration::from_millis(100));
        assert!(!remove_returned.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        assert!(dispatcher.join().unwrap());
        remover.join().unwrap();
        assert!(remove_returned.load(Ordering::SeqCst));
        // The held-open pass still completed in order
        assert_eq!(trailing.hits(), 1);

        // Once remove_pid_filter has returned, the filter is never
        // invoked again
        registry.dispatch(&packet_for(0x40));
        assert_eq!(parked.hits.load(Ordering::SeqCst), 1);
        assert_eq!(trailing.hits(), 2);
    }

    #[test]
    #[should_panic(expected = "out of 13-bit range")]
    fn test_out_of_range_pid() {
        let registry = PidFilterRegistry::new();
        registry.add_pid_filter(0x2000, CountingFilter::new());
    }
}
