//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random changes that pass
//! validation, so properties can be checked against the change log.

use ksamati_sync_protocol::{DeviceId, NewChange, Payload};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for generating device ids.
pub fn device_id_strategy() -> impl Strategy<Value = DeviceId> {
    prop::string::string_regex("[a-z]{3,8}-[0-9]{1,3}")
        .expect("Invalid regex")
        .prop_map(DeviceId::new)
}

/// Strategy for generating valid entity type names.
pub fn entity_type_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_]{0,63}").expect("Invalid regex")
}

/// Strategy for generating entity ids.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z]{1,3}-[0-9]{1,6}").expect("Invalid regex")
}

/// Strategy for generating JSON scalar values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        prop::string::string_regex("[a-zA-Z0-9 ]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for generating entity documents (non-empty JSON objects).
pub fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z_]{1,12}").expect("Invalid regex"),
        scalar_strategy(),
        1..6,
    )
    .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<_, _>>()))
}

/// Strategy for generating a valid change made on `device`.
pub fn new_change_strategy(device: DeviceId) -> impl Strategy<Value = NewChange> {
    let create = {
        let device = device.clone();
        (entity_type_strategy(), entity_id_strategy(), payload_strategy())
            .prop_map(move |(ty, id, payload)| NewChange::create(device.clone(), ty, id, payload))
    };
    let update = {
        let device = device.clone();
        (
            entity_type_strategy(),
            entity_id_strategy(),
            1..100u64,
            payload_strategy(),
        )
            .prop_map(move |(ty, id, version, payload)| {
                NewChange::update(device.clone(), ty, id, version, payload)
            })
    };
    let delete = (entity_type_strategy(), entity_id_strategy(), 1..100u64)
        .prop_map(move |(ty, id, version)| NewChange::delete(device.clone(), ty, id, version));

    prop_oneof![
        3 => create,
        2 => update,
        1 => delete,
    ]
}

/// Strategy for generating a batch of changes from several devices.
pub fn change_batch_strategy(
    devices: usize,
    max_changes: usize,
) -> impl Strategy<Value = Vec<NewChange>> {
    let ids: Vec<DeviceId> = (0..devices.max(1))
        .map(|i| DeviceId::new(format!("device-{}", i)))
        .collect();
    prop::collection::vec(prop::sample::select(ids), 1..max_changes.max(2))
        .prop_flat_map(|owners| {
            owners
                .into_iter()
                .map(new_change_strategy)
                .collect::<Vec<_>>()
        })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
