//! Per-device cycle leases.

use crate::error::{SyncError, SyncResult};
use ksamati_sync_protocol::DeviceId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held while a cycle runs for a device; released on drop.
#[derive(Debug)]
pub struct CycleLease {
    device_id: DeviceId,
    _guard: OwnedMutexGuard<()>,
}

impl CycleLease {
    /// Returns the leased device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

/// Grants at most one lease per device at a time.
#[derive(Debug, Default)]
pub struct DeviceLeases {
    locks: Mutex<HashMap<DeviceId, Arc<AsyncMutex<()>>>>,
}

impl DeviceLeases {
    /// Creates an empty lease table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease of a device without waiting.
    ///
    /// # Errors
    ///
    /// [`SyncError::CycleInProgress`] if the lease is held.
    pub fn try_acquire(&self, device_id: &DeviceId) -> SyncResult<CycleLease> {
        let lock = Arc::clone(
            self.locks
                .lock()
                .entry(device_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );
        let guard = lock
            .try_lock_owned()
            .map_err(|_| SyncError::CycleInProgress(device_id.clone()))?;
        Ok(CycleLease {
            device_id: device_id.clone(),
            _guard: guard,
        })
    }

    /// Returns true if a cycle holds the device's lease.
    pub fn is_held(&self, device_id: &DeviceId) -> bool {
        self.locks
            .lock()
            .get(device_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_lease_per_device() {
        let leases = DeviceLeases::new();
        let tablet = DeviceId::new("tablet");

        let lease = leases.try_acquire(&tablet).unwrap();
        assert_eq!(lease.device_id(), &tablet);
        assert!(leases.is_held(&tablet));
        assert!(matches!(
            leases.try_acquire(&tablet),
            Err(SyncError::CycleInProgress(_))
        ));

        drop(lease);
        assert!(!leases.is_held(&tablet));
        assert!(leases.try_acquire(&tablet).is_ok());
    }

    #[test]
    fn devices_are_independent() {
        let leases = DeviceLeases::new();
        let _a = leases.try_acquire(&DeviceId::new("a")).unwrap();
        assert!(leases.try_acquire(&DeviceId::new("b")).is_ok());
    }
}
