//! Setting value nodes.
//!
//! A `Setting` holds one configurable value together with everything needed
//! to judge it: the available values it must fit, loading and initialization
//! flags, the persisted marker and an optional override.
//!
//! Mutators never emit events themselves. They return a `SettingChanges`
//! describing what flipped; the owning graph turns that into notifications
//! and schedules dependents.
//!
//! # Invariants
//!
//! - An override, when present, is the effective value.
//! - A persisted value is kept only while it is valid. Once proven invalid
//!   the marker is cleared and the setting is flagged as rejected until its
//!   value changes.
//! - `initialized` never reverts to false.
//! - `is_valid` is always `validator(effective, available)`, where validator
//!   is the custom one if registered, otherwise the category policy.

use serde::de::DeserializeOwned;
use serde_json::Value;
use strata_core::{OverrideSource, SettingKind};

use crate::category::{AvailableValues, Category};
use crate::error::EngineError;
use crate::events::SettingEvent;
use crate::registry::{CustomPolicy, SettingDefinition, ValueCodec};

/// What a mutation changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SettingChanges {
    pub value: bool,
    pub validity: bool,
    pub available_values: bool,
    pub loading: bool,
    pub initialized: bool,
    pub persisted: bool,
    pub override_value: bool,
    pub override_source: bool,
}

impl SettingChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Value and persisted-state changes re-run the dependencies that read
    /// the setting.
    pub fn triggers_dependents(&self) -> bool {
        self.value || self.persisted
    }

    /// Changes that may move the aggregate state.
    pub fn affects_aggregate(&self) -> bool {
        self.value
            || self.validity
            || self.loading
            || self.initialized
            || self.persisted
            || self.available_values
    }
}

#[derive(Clone)]
pub struct Setting {
    kind: SettingKind,
    label: String,
    category: Category,
    is_static: bool,
    value: Value,
    is_valid: bool,
    available_values: AvailableValues,
    loading: bool,
    initialized: bool,
    persisted: bool,
    persisted_rejected: bool,
    override_value: Option<Value>,
    override_source: OverrideSource,
    policy: CustomPolicy,
    codec: ValueCodec,
}

impl Setting {
    pub fn from_definition(def: &SettingDefinition) -> Self {
        let mut setting = Self {
            kind: def.kind,
            label: def.label.clone(),
            category: def.category,
            is_static: def.is_static,
            value: def.default_value.clone(),
            is_valid: false,
            available_values: if def.is_static {
                AvailableValues::Unconstrained
            } else {
                AvailableValues::Empty
            },
            loading: false,
            initialized: def.is_static,
            persisted: false,
            persisted_rejected: false,
            override_value: None,
            override_source: OverrideSource::None,
            policy: def.policy.clone(),
            codec: def.codec.clone(),
        };
        setting.is_valid = setting.compute_validity();
        setting
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn kind(&self) -> SettingKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// The setting's own value, ignoring any override.
    pub fn underlying_value(&self) -> &Value {
        &self.value
    }

    /// Override value if present, otherwise the setting's own value.
    pub fn value(&self) -> &Value {
        self.override_value.as_ref().unwrap_or(&self.value)
    }

    pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.value().clone()).ok()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn available_values(&self) -> &AvailableValues {
        &self.available_values
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// True while the setting still holds a persisted value that was proven
    /// invalid.
    pub fn is_persisted_rejected(&self) -> bool {
        self.persisted_rejected
    }

    pub fn override_value(&self) -> Option<&Value> {
        self.override_value.as_ref()
    }

    pub fn override_source(&self) -> OverrideSource {
        self.override_source
    }

    // ========================================================================
    // Policy
    // ========================================================================

    fn check(&self, value: &Value, available: &AvailableValues) -> bool {
        match &self.policy.validator {
            Some(validator) => validator(value, available),
            None => self.category.is_valid(value, available),
        }
    }

    /// Custom fixup, else category fixup. A custom validator without a
    /// custom fixup leaves the value untouched.
    fn repaired(&self, value: &Value, available: &AvailableValues) -> Value {
        match (&self.policy.fixup, &self.policy.validator) {
            (Some(fixup), _) => fixup(value, available),
            (None, Some(_)) => value.clone(),
            (None, None) => self.category.fixup(value, available),
        }
    }

    fn compute_validity(&self) -> bool {
        self.is_static || self.check(self.value(), &self.available_values)
    }

    fn revalidate(&mut self, changes: &mut SettingChanges) {
        let valid = self.compute_validity();
        if valid != self.is_valid {
            self.is_valid = valid;
            changes.validity = true;
        }
    }

    /// Bring the setting's own value in line with the available values.
    /// Skipped while an override is the effective value.
    fn reconcile(&mut self, changes: &mut SettingChanges) {
        if self.is_static || !self.initialized || self.override_value.is_some() {
            return;
        }
        if self.check(&self.value, &self.available_values) {
            return;
        }
        if self.persisted {
            log::debug!("{}: persisted value {} rejected", self.kind, self.value);
            self.persisted = false;
            self.persisted_rejected = true;
            changes.persisted = true;
            changes.value = true;
        } else {
            let repaired = self.repaired(&self.value, &self.available_values);
            self.replace_value(repaired, changes);
        }
    }

    fn replace_value(&mut self, value: Value, changes: &mut SettingChanges) {
        if value == self.value {
            return;
        }
        self.value = value;
        self.persisted_rejected = false;
        changes.value = true;
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// User edit. Ignored if deep-equal to the current value. Clears the
    /// persisted marker. While overridden only the underlying value moves,
    /// so no value change is reported.
    pub fn set_value(&mut self, value: Value) -> SettingChanges {
        let mut changes = SettingChanges::default();
        if value == self.value {
            return changes;
        }
        if self.persisted {
            self.persisted = false;
            changes.persisted = true;
        }
        let before = self.value().clone();
        self.replace_value(value, &mut changes);
        changes.value = *self.value() != before;
        self.revalidate(&mut changes);
        changes
    }

    /// Apply freshly computed available values.
    ///
    /// A non-persisted invalid value is repaired. A persisted invalid value
    /// is not repaired: the marker is dropped and the setting is flagged as
    /// rejected, so the next pass falls back to fixup.
    pub fn set_available_values(&mut self, available: AvailableValues) -> SettingChanges {
        let mut changes = SettingChanges::default();
        if self.is_static || (self.initialized && available == self.available_values) {
            return changes;
        }

        self.available_values = available;
        changes.available_values = true;

        if !self.initialized {
            self.initialized = true;
            changes.initialized = true;
        }
        self.reconcile(&mut changes);
        self.revalidate(&mut changes);
        changes
    }

    /// An upstream computed nothing. The setting has no valid configuration
    /// right now, but nothing is repaired or rejected and an uninitialized
    /// setting stays uninitialized.
    pub fn clear_available_values(&mut self) -> SettingChanges {
        let mut changes = SettingChanges::default();
        if self.is_static || self.available_values == AvailableValues::Empty {
            return changes;
        }
        self.available_values = AvailableValues::Empty;
        changes.available_values = true;
        self.revalidate(&mut changes);
        changes
    }

    pub fn set_loading(&mut self, loading: bool) -> SettingChanges {
        let mut changes = SettingChanges::default();
        if self.loading != loading {
            self.loading = loading;
            changes.loading = true;
        }
        changes
    }

    /// Install or clear an override.
    ///
    /// Clearing restores the setting's own value and repairs it if it no
    /// longer fits the current available values (a persisted value is
    /// rejected instead).
    pub fn set_override(&mut self, value: Option<Value>, source: OverrideSource) -> SettingChanges {
        let mut changes = SettingChanges::default();
        let source = if value.is_some() {
            source
        } else {
            OverrideSource::None
        };
        if value == self.override_value && source == self.override_source {
            return changes;
        }

        let before = self.value().clone();
        let clearing = self.override_value.is_some() && value.is_none();

        if value != self.override_value {
            self.override_value = value;
            changes.override_value = true;
        }
        if source != self.override_source {
            self.override_source = source;
            changes.override_source = true;
        }

        if clearing {
            self.reconcile(&mut changes);
        }

        if *self.value() != before {
            changes.value = true;
        }
        self.revalidate(&mut changes);
        changes
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Encode the effective value.
    pub fn serialize_value(&self) -> String {
        self.codec.encode(self.value())
    }

    /// Decode a persisted value and hold it provisionally.
    ///
    /// If available values are already known the value is checked right away
    /// and rejected if it does not fit.
    pub fn deserialize_value(&mut self, s: &str) -> Result<SettingChanges, EngineError> {
        let value = self.codec.decode(s).map_err(|message| EngineError::Deserialize {
            kind: self.kind,
            message,
        })?;

        let mut changes = SettingChanges::default();
        self.replace_value(value, &mut changes);

        if !self.is_static {
            if self.initialized && !self.check(&self.value, &self.available_values) {
                if self.persisted {
                    self.persisted = false;
                    changes.persisted = true;
                }
                self.persisted_rejected = true;
            } else if !self.persisted {
                self.persisted = true;
                changes.persisted = true;
            }
        }

        self.revalidate(&mut changes);
        Ok(changes)
    }

    /// Notifications for `changes`, in delivery order.
    pub fn events_for(&self, changes: &SettingChanges) -> Vec<SettingEvent> {
        let kind = self.kind;
        let mut events = Vec::new();
        if changes.value {
            events.push(SettingEvent::ValueAboutToBeChanged { kind });
            events.push(SettingEvent::ValueChanged {
                kind,
                value: self.value().clone(),
            });
        }
        if changes.validity {
            events.push(SettingEvent::ValidityChanged {
                kind,
                is_valid: self.is_valid,
            });
        }
        if changes.available_values {
            events.push(SettingEvent::AvailableValuesChanged { kind });
        }
        if changes.override_value {
            events.push(SettingEvent::OverriddenValueChanged {
                kind,
                value: self.override_value.clone(),
            });
        }
        if changes.override_source {
            events.push(SettingEvent::OverrideSourceChanged {
                kind,
                source: self.override_source,
            });
        }
        if changes.persisted {
            events.push(SettingEvent::PersistedChanged {
                kind,
                persisted: self.persisted,
            });
        }
        if changes.initialized {
            events.push(SettingEvent::InitializedChanged { kind });
        }
        if changes.loading {
            events.push(SettingEvent::LoadingChanged {
                kind,
                loading: self.loading,
            });
        }
        events
    }
}

impl std::fmt::Debug for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Setting")
            .field("kind", &self.kind)
            .field("value", &self.value)
            .field("is_valid", &self.is_valid)
            .field("available_values", &self.available_values)
            .field("loading", &self.loading)
            .field("initialized", &self.initialized)
            .field("persisted", &self.persisted)
            .field("override_value", &self.override_value)
            .finish()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Effective values of every setting in a graph, in graph order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SettingsSnapshot {
    entries: Vec<(SettingKind, Value)>,
}

impl SettingsSnapshot {
    pub fn new(entries: Vec<(SettingKind, Value)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, kind: SettingKind) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| *k == kind).map(|(_, v)| v)
    }

    pub fn get_as<T: DeserializeOwned>(&self, kind: SettingKind) -> Option<T> {
        self.get(kind)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (SettingKind, &Value)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
