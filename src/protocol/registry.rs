//! Peer id to device handle routing for one connection.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::device::DeviceHandle;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Connection-owned map of known devices.
///
/// At most one non-replaced handle exists per peer id. A superseded handle is
/// never removed from the caller's hands; it is marked replaced and fails
/// every further operation with `DeviceReplaced`.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<u32, DeviceHandle>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle`, marking any previous handle for the same peer id as
    /// replaced.
    pub fn register(&self, handle: DeviceHandle) -> Result<()> {
        handle.check_active()?;

        let mut devices = self
            .devices
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;

        let peer_id = handle.peer_id();
        if let Some(previous) = devices.insert(peer_id, handle.clone()) {
            if !previous.ptr_eq(&handle) {
                previous.mark_replaced();
            }
        }

        debug!(peer_id, uid = handle.uid(), "Registered device");
        Ok(())
    }

    pub fn lookup(&self, peer_id: u32) -> Option<DeviceHandle> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer_id)
            .cloned()
    }

    /// Whether `handle` is the current registration for its peer id.
    pub fn contains(&self, handle: &DeviceHandle) -> bool {
        self.lookup(handle.peer_id())
            .is_some_and(|current| current.ptr_eq(handle))
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered handle.
    pub fn handles(&self) -> Vec<DeviceHandle> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_unknown_is_none() {
        let registry = DeviceRegistry::new();
        assert!(registry.lookup(42).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_second_registration_replaces_first() {
        let registry = DeviceRegistry::new();
        let first = DeviceHandle::new("abc").unwrap();
        let second = DeviceHandle::new("abc").unwrap();

        registry.register(first.clone()).unwrap();
        registry.register(second.clone()).unwrap();

        assert!(first.is_replaced());
        assert!(!second.is_replaced());
        assert!(registry.lookup(second.peer_id()).unwrap().ptr_eq(&second));
        assert!(!registry.contains(&first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregistering_same_handle_is_noop() {
        let registry = DeviceRegistry::new();
        let device = DeviceHandle::new("abc").unwrap();
        registry.register(device.clone()).unwrap();
        registry.register(device.clone()).unwrap();
        assert!(!device.is_replaced());
    }

    #[test]
    fn test_replaced_handle_cannot_come_back() {
        let registry = DeviceRegistry::new();
        let first = DeviceHandle::new("abc").unwrap();
        registry.register(first.clone()).unwrap();
        registry.register(DeviceHandle::new("abc").unwrap()).unwrap();
        assert!(matches!(
            registry.register(first),
            Err(ProtocolError::DeviceReplaced)
        ));
    }
}
