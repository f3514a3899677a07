//! Cross-crate integration test helpers.
//!
//! Provides an in-process central store and a set of devices, each
//! with its own local store and coordinator, for end-to-end sync tests.

use async_trait::async_trait;
use ksamati_store::SyncStore;
use ksamati_sync_engine::{
    RemoteStore, SyncConfig, SyncCoordinator, SyncCycleResult, SyncError, SyncResult,
};
use ksamati_sync_protocol::{
    ChangeEntry, DeviceId, EntityKey, NewChange, Payload, PullRequest, PullResponse, PushRequest,
    PushResponse,
};
use ksamati_sync_server::{ServerConfig, SyncServer};
use std::sync::Arc;

/// A remote store that calls an in-process server directly.
#[derive(Clone)]
pub struct ServerRemote {
    server: Arc<SyncServer>,
}

impl ServerRemote {
    /// Creates a remote over a shared server.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl RemoteStore for ServerRemote {
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.server
            .handle_pull(request.clone())
            .map_err(|e| SyncError::Rejected(e.to_string()))
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.server
            .handle_push(request.clone())
            .map_err(|e| SyncError::Rejected(e.to_string()))
    }
}

/// One simulated device.
pub struct TestDevice {
    /// Device id.
    pub id: DeviceId,
    /// The device's local store.
    pub store: Arc<SyncStore>,
    /// The device's coordinator.
    pub coordinator: SyncCoordinator<ServerRemote>,
}

/// A test harness for end-to-end sync between devices.
pub struct SyncHarness {
    /// The shared central store.
    pub server: Arc<SyncServer>,
    config: SyncConfig,
    devices: Vec<TestDevice>,
}

impl SyncHarness {
    /// Creates a harness with a default server.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default(), SyncConfig::default())
    }

    /// Creates a harness with explicit server and device configuration.
    pub fn with_config(server: ServerConfig, config: SyncConfig) -> Self {
        Self {
            server: Arc::new(SyncServer::new(server)),
            config,
            devices: Vec::new(),
        }
    }

    /// Adds a device with a fresh in-memory store.
    pub fn add_device(&mut self, name: &str) -> DeviceId {
        let id = DeviceId::new(name);
        let store = Arc::new(SyncStore::in_memory().expect("Failed to open store"));
        let coordinator = SyncCoordinator::new(
            self.config.clone(),
            Arc::clone(&store),
            ServerRemote::new(Arc::clone(&self.server)),
        );
        self.devices.push(TestDevice {
            id: id.clone(),
            store,
            coordinator,
        });
        id
    }

    /// Returns a device by id.
    ///
    /// # Panics
    ///
    /// Panics if the device was never added.
    pub fn device(&self, id: &DeviceId) -> &TestDevice {
        self.devices
            .iter()
            .find(|d| &d.id == id)
            .unwrap_or_else(|| panic!("Unknown device {}", id))
    }

    /// Returns every device.
    pub fn devices(&self) -> &[TestDevice] {
        &self.devices
    }

    /// Records a create on a device.
    pub fn create(
        &self,
        id: &DeviceId,
        entity_type: &str,
        entity_id: &str,
        payload: Payload,
    ) -> ChangeEntry {
        self.device(id)
            .store
            .change_log()
            .append(NewChange::create(id.clone(), entity_type, entity_id, payload))
            .expect("Failed to append create")
    }

    /// Records an update on a device, based on the version it knows.
    pub fn update(
        &self,
        id: &DeviceId,
        entity_type: &str,
        entity_id: &str,
        payload: Payload,
    ) -> ChangeEntry {
        let store = &self.device(id).store;
        let version = store
            .change_log()
            .known_version(&EntityKey::new(entity_type, entity_id));
        store
            .change_log()
            .append(NewChange::update(
                id.clone(),
                entity_type,
                entity_id,
                version,
                payload,
            ))
            .expect("Failed to append update")
    }

    /// Records a delete on a device, based on the version it knows.
    pub fn delete(&self, id: &DeviceId, entity_type: &str, entity_id: &str) -> ChangeEntry {
        let store = &self.device(id).store;
        let version = store
            .change_log()
            .known_version(&EntityKey::new(entity_type, entity_id));
        store
            .change_log()
            .append(NewChange::delete(id.clone(), entity_type, entity_id, version))
            .expect("Failed to append delete")
    }

    /// Runs one cycle for a device.
    pub async fn sync(&self, id: &DeviceId) -> SyncCycleResult {
        self.device(id)
            .coordinator
            .sync(id)
            .await
            .unwrap_or_else(|e| panic!("Sync failed for {}: {}", id, e))
    }

    /// Runs one cycle for every device, in the order they were added.
    pub async fn sync_all(&self) -> Vec<SyncCycleResult> {
        let mut results = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            results.push(self.sync(&device.id).await);
        }
        results
    }

    /// Returns the central version of an entity (0 if unknown).
    pub fn central_version(&self, key: &EntityKey) -> u64 {
        self.server.store().version(key)
    }

    /// Asserts that every device knows the central version of `key`.
    pub fn assert_converged(&self, key: &EntityKey) {
        let expected = self.central_version(key);
        for device in &self.devices {
            assert_eq!(
                device.store.change_log().known_version(key),
                expected,
                "Device {} has not converged on {}",
                device.id,
                key
            );
        }
    }

    /// Asserts that no device has pending entries.
    pub fn assert_drained(&self) {
        for device in &self.devices {
            assert_eq!(
                device.store.change_log().pending_count(&device.id),
                0,
                "Device {} still has pending entries",
                device.id
            );
        }
    }
}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn devices_converge() {
        let mut harness = SyncHarness::new();
        let tablet = harness.add_device("tablet");
        let laptop = harness.add_device("laptop");
        let key = EntityKey::new("contract", "C-1");

        harness.create(&tablet, "contract", "C-1", json!({"amount": 100}));
        harness.sync_all().await;
        harness.update(&laptop, "contract", "C-1", json!({"amount": 120}));
        harness.sync_all().await;
        harness.sync_all().await;

        assert_eq!(harness.central_version(&key), 2);
        harness.assert_converged(&key);
        harness.assert_drained();
    }

    #[tokio::test]
    async fn delete_propagates() {
        let mut harness = SyncHarness::new();
        let tablet = harness.add_device("tablet");
        let phone = harness.add_device("phone");
        let key = EntityKey::new("expense", "E-1");

        harness.create(&tablet, "expense", "E-1", json!({"amount": 40}));
        harness.sync(&tablet).await;
        let pulled = harness.sync(&phone).await;
        assert_eq!(pulled.pulled, 1);

        harness.delete(&phone, "expense", "E-1");
        let result = harness.sync(&phone).await;
        assert_eq!(result.applied.len(), 1);
        harness.sync(&tablet).await;

        let state = harness.server.store().entity(&key).unwrap();
        assert!(state.deleted);
        harness.assert_converged(&key);
    }

    #[tokio::test]
    async fn stale_update_produces_conflict() {
        let mut harness = SyncHarness::new();
        let tablet = harness.add_device("tablet");
        let laptop = harness.add_device("laptop");

        harness.create(&tablet, "contract", "C-9", json!({"amount": 1}));
        harness.sync_all().await;

        harness.update(&tablet, "contract", "C-9", json!({"amount": 2}));
        harness.update(&laptop, "contract", "C-9", json!({"amount": 3}));
        harness.sync(&tablet).await;
        let result = harness.sync(&laptop).await;

        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.pending_count, 0);
        harness.assert_drained();
    }
}
