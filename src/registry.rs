//! Device arena.
//!
//! Devices live in the registry; everything else refers to them by
//! [`DeviceId`]. Removing a device empties its slot, so stale ids held by a
//! device set resolve to "torn down" instead of dangling.

use crate::devices::{Capability, Device, DeviceGeometry, Role, Settable};
use serde::{Deserialize, Serialize};
use std::fmt;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Handle to a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A device shared between the registry and whoever is driving it.
pub type SharedDevice = Arc<Mutex<Device>>;

struct Slot {
    name: String,
    role: Role,
    capabilities: Vec<Capability>,
    geometry: DeviceGeometry,
    device: SharedDevice,
}

/// Owner of every device in a session.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    slots: Arc<RwLock<Vec<Option<Slot>>>>,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.names())
            .finish()
    }
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Option<Slot>>> {
        self.slots.read()
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Option<Slot>>> {
        self.slots.write()
    }

    /// Take ownership of `device` and return its handle.
    pub fn insert(&self, device: Device) -> DeviceId {
        let slot = Slot {
            name: device.id().to_string(),
            role: device.role(),
            capabilities: device.capabilities(),
            geometry: device.geometry(),
            device: Arc::new(Mutex::new(device)),
        };
        let mut slots = self.write();
        slots.push(Some(slot));
        DeviceId(slots.len() - 1)
    }

    /// Shared handle of a live device.
    pub fn get(&self, id: DeviceId) -> Option<SharedDevice> {
        self.read()
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|slot| Arc::clone(&slot.device))
    }

    /// Handle of the live device called `name`.
    pub fn lookup(&self, name: &str) -> Option<DeviceId> {
        self.read()
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.name == name))
            .map(DeviceId)
    }

    /// Name of a live device.
    pub fn name(&self, id: DeviceId) -> Option<String> {
        self.read()
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|slot| slot.name.clone())
    }

    /// Role of a live device.
    pub fn role(&self, id: DeviceId) -> Option<Role> {
        self.read().get(id.0).and_then(Option::as_ref).map(|slot| slot.role)
    }

    /// Capabilities recorded when the device was inserted. Does not lock the device.
    pub fn capabilities(&self, id: DeviceId) -> Option<Vec<Capability>> {
        self.read()
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|slot| slot.capabilities.clone())
    }

    /// Axis and module counts recorded at insertion.
    pub fn geometry(&self, id: DeviceId) -> Option<DeviceGeometry> {
        self.read().get(id.0).and_then(Option::as_ref).map(|slot| slot.geometry)
    }

    /// Whether a live device has `capability`.
    pub fn supports(&self, id: DeviceId, capability: Capability) -> bool {
        self.capabilities(id)
            .is_some_and(|caps| caps.contains(&capability))
    }

    /// Tear a device down. Its id stays reserved and resolves to nothing.
    pub fn remove(&self, id: DeviceId) -> Option<SharedDevice> {
        let slot = self.write().get_mut(id.0).and_then(Option::take)?;
        info!(device = %slot.name, id = %id, "device removed");
        Some(slot.device)
    }

    /// Handles of all live devices, in insertion order.
    pub fn ids(&self) -> Vec<DeviceId> {
        self.read()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| DeviceId(index))
            .collect()
    }

    /// Names of all live devices, in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.read()
            .iter()
            .flatten()
            .map(|slot| slot.name.clone())
            .collect()
    }

    /// Number of live devices.
    pub fn len(&self) -> usize {
        self.read().iter().flatten().count()
    }

    /// Whether no device is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use crate::devices::{Generator, KeysightGen};
    use crate::link::{InstrumentLink, LinkConfig};

    fn generator(name: &str) -> Device {
        let link = InstrumentLink::new(name, Box::new(MockTransport::new(name)), LinkConfig::default());
        Device::Generator(Generator::new(name, link, Box::new(KeysightGen)))
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = DeviceRegistry::new();
        let a = registry.insert(generator("gen_a"));
        let b = registry.insert(generator("gen_b"));
        assert_ne!(a, b);
        assert_eq!(registry.lookup("gen_b"), Some(b));
        assert_eq!(registry.name(a).as_deref(), Some("gen_a"));
        assert_eq!(registry.role(a), Some(Role::Generator));
        assert!(registry.supports(a, Capability::Frequency));
        assert!(!registry.supports(a, Capability::Angle));
        assert_eq!(registry.geometry(a), Some(DeviceGeometry::default()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_removed_slot_is_empty_not_reused() {
        let registry = DeviceRegistry::new();
        let a = registry.insert(generator("gen_a"));
        assert!(registry.remove(a).is_some());
        assert!(registry.get(a).is_none());
        assert!(registry.remove(a).is_none());
        assert_eq!(registry.lookup("gen_a"), None);

        let b = registry.insert(generator("gen_b"));
        assert_ne!(a, b);
        assert_eq!(registry.ids(), vec![b]);
    }

    #[tokio::test]
    async fn test_clones_share_devices() {
        let registry = DeviceRegistry::new();
        let handle = registry.clone();
        let id = registry.insert(generator("gen_a"));
        let device = handle.get(id).unwrap();
        assert_eq!(device.lock().await.id(), "gen_a");
    }
}
