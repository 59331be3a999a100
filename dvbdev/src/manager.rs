//! Device collection and hot-plug routing.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceEvent};
use crate::frontend::HardwareBackend;
use crate::types::{DeviceId, ResourceRole};

/// Capacity of the state-change broadcast channel. Lagging subscribers
/// miss events; they never block a transition.
const EVENT_CAPACITY: usize = 64;

/// Resolution of an opaque hot-plug identifier to a tuner slot resource.
#[derive(Debug, Clone)]
pub struct ResolvedComponent {
    pub device: DeviceId,
    pub role: ResourceRole,
    pub path: String,
}

/// Maps hot-plug identifiers ("udi" strings) onto tuner slots.
///
/// Injected by the surrounding system; the core never inspects the
/// identifiers themselves.
pub trait HotplugResolver: Send + Sync {
    fn resolve(&self, external_id: &str) -> Option<ResolvedComponent>;
}

/// Asynchronous hot-plug notification. No ordering is guaranteed
/// across different device ids.
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    Added(String),
    Removed(String),
}

struct ManagerInner {
    devices: HashMap<DeviceId, Arc<Device>>,
    /// Which device currently owns each attached external identifier.
    owners: HashMap<String, (DeviceId, ResourceRole)>,
}

/// Owns the device collection and routes hot-plug notifications.
///
/// Devices are created on the first resource notification for an
/// unseen id and discarded once their presence set empties out.
pub struct DeviceManager {
    backend: Arc<dyn HardwareBackend>,
    resolver: Arc<dyn HotplugResolver>,
    config: DeviceConfig,
    events: broadcast::Sender<DeviceEvent>,
    inner: Mutex<ManagerInner>,
}

impl DeviceManager {
    pub fn new(
        backend: Arc<dyn HardwareBackend>,
        resolver: Arc<dyn HotplugResolver>,
        config: DeviceConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            backend,
            resolver,
            config,
            events,
            inner: Mutex::new(ManagerInner {
                devices: HashMap::new(),
                owners: HashMap::new(),
            }),
        })
    }

    /// Subscribe to state changes of every managed device.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Route one attach notification. Unresolvable identifiers are
    /// logged and ignored, never fatal.
    pub async fn component_added(&self, external_id: &str) {
        let Some(resolved) = self.resolver.resolve(external_id) else {
            debug!("ignoring unresolvable component {}", external_id);
            return;
        };

        let mut inner = self.inner.lock().await;
        let device = match inner.devices.get(&resolved.device) {
            Some(device) => Arc::clone(device),
            None => {
                info!("new device {}", resolved.device);
                let device = Device::new(
                    resolved.device,
                    Arc::clone(&self.backend),
                    self.config,
                    self.events.clone(),
                );
                inner.devices.insert(resolved.device, Arc::clone(&device));
                device
            }
        };
        inner
            .owners
            .insert(external_id.to_owned(), (resolved.device, resolved.role));
        device.component_added(resolved.role, &resolved.path).await;
    }

    /// Route one detach notification; discards the device once its
    /// presence set is empty.
    pub async fn component_removed(&self, external_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some((device_id, role)) = inner.owners.remove(external_id) else {
            debug!("ignoring removal of unknown component {}", external_id);
            return;
        };
        let Some(device) = inner.devices.get(&device_id).cloned() else {
            warn!("owner table referenced unknown device {}", device_id);
            return;
        };

        if device.component_removed(role).await {
            info!("discarding {} (no resources left)", device_id);
            inner.devices.remove(&device_id);
        }
    }

    /// Snapshot of currently known devices, in unspecified order.
    pub async fn device_list(&self) -> Vec<Arc<Device>> {
        self.inner.lock().await.devices.values().cloned().collect()
    }

    pub async fn get_device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.inner.lock().await.devices.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.devices.len()
    }

    /// Drain a hot-plug event channel until the sender goes away.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<HotplugEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                HotplugEvent::Added(id) => self.component_added(&id).await,
                HotplugEvent::Removed(id) => self.component_removed(&id).await,
            }
        }
        debug!("hot-plug event source closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBackend, SimFrontend, TableResolver};
    use crate::types::{DeviceState, TransmissionType, TransmissionTypes};

    fn satellite_types() -> TransmissionTypes {
        [TransmissionType::Satellite].into_iter().collect()
    }

    /// Install a full sim device under `id` and register its three
    /// mandatory udis plus backend resources.
    fn install_device(
        backend: &SimBackend,
        resolver: &TableResolver,
        id: u32,
    ) -> Arc<SimFrontend> {
        let frontend = SimFrontend::new("SIM-FE", satellite_types());
        let fe_path = format!("/dev/dvb{id}.frontend0");
        let dvr_path = format!("/dev/dvb{id}.dvr0");
        backend.install_frontend(&fe_path, Arc::clone(&frontend));
        backend.install_stream(&dvr_path);

        resolver.insert(
            &format!("udi-{id}-frontend"),
            DeviceId(id),
            ResourceRole::Frontend,
            &fe_path,
        );
        resolver.insert(
            &format!("udi-{id}-demux"),
            DeviceId(id),
            ResourceRole::Demux,
            &format!("/dev/dvb{id}.demux0"),
        );
        resolver.insert(
            &format!("udi-{id}-dvr"),
            DeviceId(id),
            ResourceRole::StreamSource,
            &dvr_path,
        );
        frontend
    }

    fn manager_with(
        backend: &Arc<SimBackend>,
        resolver: &Arc<TableResolver>,
    ) -> Arc<DeviceManager> {
        DeviceManager::new(
            Arc::clone(backend) as Arc<dyn HardwareBackend>,
            Arc::clone(resolver) as Arc<dyn HotplugResolver>,
            DeviceConfig::default(),
        )
    }

    async fn add_all(manager: &DeviceManager, id: u32) {
        for kind in ["frontend", "demux", "dvr"] {
            manager.component_added(&format!("udi-{id}-{kind}")).await;
        }
    }

    #[tokio::test]
    async fn test_unresolvable_id_ignored() {
        let backend = SimBackend::new();
        let resolver = TableResolver::new();
        let manager = manager_with(&backend, &resolver);

        manager.component_added("udi-bogus").await;
        manager.component_removed("udi-bogus").await;
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn test_two_devices_independent() {
        let backend = SimBackend::new();
        let resolver = TableResolver::new();
        install_device(&backend, &resolver, 1);
        install_device(&backend, &resolver, 2);
        let manager = manager_with(&backend, &resolver);

        // Higher id first; order across devices carries no meaning
        manager.component_added("udi-2-frontend").await;
        manager.component_added("udi-1-frontend").await;
        assert_eq!(manager.count().await, 2);

        add_all(&manager, 1).await;
        let dev1 = manager.get_device(DeviceId(1)).await.unwrap();
        let dev2 = manager.get_device(DeviceId(2)).await.unwrap();
        assert_eq!(dev1.state().await, DeviceState::Idle);
        // Device 2 never completed its mandatory set
        assert_eq!(dev2.state().await, DeviceState::NotReady);
    }

    #[tokio::test]
    async fn test_device_discarded_when_presence_empties() {
        let backend = SimBackend::new();
        let resolver = TableResolver::new();
        install_device(&backend, &resolver, 3);
        let manager = manager_with(&backend, &resolver);

        add_all(&manager, 3).await;
        assert_eq!(manager.count().await, 1);
        let device = manager.get_device(DeviceId(3)).await.unwrap();
        assert_eq!(device.state().await, DeviceState::Idle);

        manager.component_removed("udi-3-frontend").await;
        // Two resources still attached, device survives as not-ready
        assert_eq!(manager.count().await, 1);
        assert_eq!(device.state().await, DeviceState::NotReady);

        manager.component_removed("udi-3-demux").await;
        manager.component_removed("udi-3-dvr").await;
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn test_device_list_snapshot() {
        let backend = SimBackend::new();
        let resolver = TableResolver::new();
        install_device(&backend, &resolver, 1);
        install_device(&backend, &resolver, 2);
        let manager = manager_with(&backend, &resolver);

        add_all(&manager, 1).await;
        add_all(&manager, 2).await;

        let mut ids: Vec<u32> = manager
            .device_list()
            .await
            .iter()
            .map(|d| d.id().0)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_event_pump() {
        let backend = SimBackend::new();
        let resolver = TableResolver::new();
        install_device(&backend, &resolver, 7);
        let manager = manager_with(&backend, &resolver);

        let (tx, rx) = mpsc::channel(16);
        let pump = tokio::spawn(Arc::clone(&manager).run(rx));

        for kind in ["frontend", "demux", "dvr"] {
            tx.send(HotplugEvent::Added(format!("udi-7-{kind}")))
                .await
                .unwrap();
        }
        tx.send(HotplugEvent::Removed("udi-7-dvr".into()))
            .await
            .unwrap();
        drop(tx);
        pump.await.unwrap();

        let device = manager.get_device(DeviceId(7)).await.unwrap();
        assert_eq!(device.state().await, DeviceState::NotReady);
        assert_eq!(manager.count().await, 1);
    }
}
