//! Override providers.
//!
//! Groups can lock a setting kind to a fixed value (`GroupOverrides`), or
//! expose a shared setting whose value drives every member layer's setting of
//! the same kind (`SharedSetting`). The graph only reads providers; the
//! caller decides which ones apply and in what order.

use rustc_hash::FxHashMap;
use serde_json::Value;
use strata_core::{OverrideSource, SettingKind};

use crate::category::AvailableValues;
use crate::error::EngineError;
use crate::graph::SettingsGraph;
use crate::registry::SettingRegistry;
use crate::setting::{Setting, SettingChanges};

/// Something that can force a setting's effective value.
pub trait OverrideProvider {
    fn source(&self) -> OverrideSource;

    /// Value to force for `kind`, or `None` to leave it alone.
    fn overridden_value(&self, kind: SettingKind) -> Option<Value>;
}

// ============================================================================
// Group overrides
// ============================================================================

/// Fixed per-kind values set on a group.
#[derive(Clone, Debug, Default)]
pub struct GroupOverrides {
    values: FxHashMap<SettingKind, Value>,
}

impl GroupOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: SettingKind, value: impl Into<Value>) -> Self {
        self.values.insert(kind, value.into());
        self
    }

    pub fn insert(&mut self, kind: SettingKind, value: Value) {
        self.values.insert(kind, value);
    }

    pub fn remove(&mut self, kind: SettingKind) -> Option<Value> {
        self.values.remove(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl OverrideProvider for GroupOverrides {
    fn source(&self) -> OverrideSource {
        OverrideSource::Group
    }

    fn overridden_value(&self, kind: SettingKind) -> Option<Value> {
        self.values.get(&kind).cloned()
    }
}

// ============================================================================
// Shared setting
// ============================================================================

/// A setting owned by a group whose available values are the intersection
/// of its member graphs' available values for the same kind.
///
/// Members that have not computed their available values yet are left out
/// of the intersection. The shared setting overrides members only once it
/// has been initialized.
#[derive(Debug)]
pub struct SharedSetting {
    setting: Setting,
}

impl SharedSetting {
    pub fn new(registry: &SettingRegistry, kind: SettingKind) -> Result<Self, EngineError> {
        Ok(Self {
            setting: registry.create_setting(kind)?,
        })
    }

    pub fn kind(&self) -> SettingKind {
        self.setting.kind()
    }

    pub fn setting(&self) -> &Setting {
        &self.setting
    }

    pub fn value(&self) -> &Value {
        self.setting.value()
    }

    pub fn set_value(&mut self, value: Value) -> SettingChanges {
        self.setting.set_value(value)
    }

    /// Recompute the intersection from `members` and refit the value.
    pub fn refresh(&mut self, members: &[&SettingsGraph]) -> SettingChanges {
        let kind = self.setting.kind();
        let category = self.setting.category();

        let contributions: Vec<AvailableValues> = members
            .iter()
            .filter_map(|graph| graph.setting(kind).ok())
            .filter(|s| s.is_initialized())
            .map(|s| s.available_values().clone())
            .collect();

        if contributions.is_empty() {
            return SettingChanges::default();
        }

        let reduced = contributions
            .iter()
            .enumerate()
            .fold(AvailableValues::Empty, |acc, (i, next)| {
                category.intersection_reduce(acc, next, i)
            });
        self.setting.set_available_values(reduced)
    }
}

impl OverrideProvider for SharedSetting {
    fn source(&self) -> OverrideSource {
        OverrideSource::SharedSetting
    }

    fn overridden_value(&self, kind: SettingKind) -> Option<Value> {
        (kind == self.setting.kind() && self.setting.is_initialized())
            .then(|| self.setting.value().clone())
    }
}
