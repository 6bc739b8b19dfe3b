//! Global context.
//!
//! Workbench-wide values (active field, loaded ensembles, realization filter,
//! ...) owned by the host. Graphs only read them and react to changes; they
//! never write.

use std::cell::RefCell;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use strata_core::EnsembleInfo;

use crate::events::{Event, EventBus, SubscriptionId};

/// Keys of the global context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GlobalKey {
    /// Identifier of the active field (string).
    FieldId,
    /// Loaded ensembles (`Vec<EnsembleInfo>`).
    Ensembles,
    /// Realizations allowed by the user's filter, per ensemble ident string.
    RealizationFilter,
    IntersectionPolylines,
    WellboreHeaders,
}

impl fmt::Display for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GlobalKey::FieldId => "fieldId",
            GlobalKey::Ensembles => "ensembles",
            GlobalKey::RealizationFilter => "realizationFilter",
            GlobalKey::IntersectionPolylines => "intersectionPolylines",
            GlobalKey::WellboreHeaders => "wellboreHeaders",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GlobalEvent {
    pub key: GlobalKey,
    pub value: Value,
}

impl Event for GlobalEvent {
    type Topic = GlobalKey;

    fn topic(&self) -> GlobalKey {
        self.key
    }
}

#[derive(Default)]
pub struct GlobalContext {
    values: RefCell<FxHashMap<GlobalKey, Value>>,
    events: EventBus<GlobalEvent>,
}

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, `Null` if never set.
    pub fn get(&self, key: GlobalKey) -> Value {
        self.values
            .borrow()
            .get(&key)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Replace a value and notify subscribers. Setting a deep-equal value is
    /// a no-op.
    pub fn set(&self, key: GlobalKey, value: Value) {
        {
            let mut values = self.values.borrow_mut();
            let current = values.get(&key).unwrap_or(&Value::Null);
            if *current == value {
                return;
            }
            values.insert(key, value.clone());
        }
        log::debug!("global {key} changed");
        self.events.emit(&GlobalEvent { key, value });
    }

    pub fn set_serialized<T: Serialize>(&self, key: GlobalKey, value: &T) -> Result<(), serde_json::Error> {
        self.set(key, serde_json::to_value(value)?);
        Ok(())
    }

    pub fn set_field_id(&self, field: impl Into<String>) {
        self.set(GlobalKey::FieldId, Value::String(field.into()));
    }

    pub fn set_ensembles(&self, ensembles: &[EnsembleInfo]) -> Result<(), serde_json::Error> {
        self.set_serialized(GlobalKey::Ensembles, &ensembles)
    }

    pub fn subscribe(&self, callback: impl Fn(&GlobalEvent) + 'static) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    pub fn subscribe_key(
        &self,
        key: GlobalKey,
        callback: impl Fn(&GlobalEvent) + 'static,
    ) -> SubscriptionId {
        self.events.subscribe_topic(key, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.listener_count()
    }
}
