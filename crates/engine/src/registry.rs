//! Setting registry.
//!
//! Maps each `SettingKind` to a `SettingDefinition`: category, label, default
//! value, optional custom validator/fixup, static flag and string codec.
//! Graphs create their settings from a registry; an unregistered kind is a
//! construction error, never a runtime state.

use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use strata_core::{EnsembleIdent, SettingKind};

use crate::category::{AvailableValues, Category};
use crate::error::EngineError;
use crate::setting::Setting;

pub type Validator = Rc<dyn Fn(&Value, &AvailableValues) -> bool>;
pub type Fixup = Rc<dyn Fn(&Value, &AvailableValues) -> Value>;

/// Per-kind replacement for the category policy.
///
/// A custom validator replaces `Category::is_valid`. When a validator is set
/// without a fixup, invalid values are left as they are instead of being
/// repaired by the category.
#[derive(Clone, Default)]
pub struct CustomPolicy {
    pub validator: Option<Validator>,
    pub fixup: Option<Fixup>,
}

impl CustomPolicy {
    pub fn is_empty(&self) -> bool {
        self.validator.is_none() && self.fixup.is_none()
    }
}

// ============================================================================
// Value codec
// ============================================================================

type Encode = Rc<dyn Fn(&Value) -> String>;
type Decode = Rc<dyn Fn(&str) -> Result<Value, String>>;

/// String encoding used at the persistence boundary.
#[derive(Clone, Default)]
pub enum ValueCodec {
    /// Compact JSON text.
    #[default]
    Json,
    Custom { encode: Encode, decode: Decode },
}

impl ValueCodec {
    pub fn custom(
        encode: impl Fn(&Value) -> String + 'static,
        decode: impl Fn(&str) -> Result<Value, String> + 'static,
    ) -> Self {
        ValueCodec::Custom {
            encode: Rc::new(encode),
            decode: Rc::new(decode),
        }
    }

    /// `"<case uuid>::<ensemble name>"`, empty string for no selection.
    pub fn ensemble_ident() -> Self {
        Self::custom(
            |value| match serde_json::from_value::<EnsembleIdent>(value.clone()) {
                Ok(ident) => ident.to_string(),
                Err(_) if value.is_null() => String::new(),
                Err(_) => value.to_string(),
            },
            |s| {
                if s.is_empty() {
                    return Ok(Value::Null);
                }
                let ident = EnsembleIdent::parse(s)
                    .ok_or_else(|| format!("'{s}' is not a '<case uuid>::<ensemble name>' ident"))?;
                serde_json::to_value(ident).map_err(|e| e.to_string())
            },
        )
    }

    pub fn encode(&self, value: &Value) -> String {
        match self {
            ValueCodec::Json => value.to_string(),
            ValueCodec::Custom { encode, .. } => encode(value),
        }
    }

    pub fn decode(&self, s: &str) -> Result<Value, String> {
        match self {
            ValueCodec::Json => serde_json::from_str(s).map_err(|e| e.to_string()),
            ValueCodec::Custom { decode, .. } => decode(s),
        }
    }
}

impl fmt::Debug for ValueCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueCodec::Json => write!(f, "Json"),
            ValueCodec::Custom { .. } => write!(f, "Custom"),
        }
    }
}

// ============================================================================
// Definitions
// ============================================================================

/// Everything needed to construct a `Setting` of one kind.
#[derive(Clone)]
pub struct SettingDefinition {
    pub kind: SettingKind,
    pub category: Category,
    pub label: String,
    pub default_value: Value,
    pub is_static: bool,
    pub policy: CustomPolicy,
    pub codec: ValueCodec,
}

impl SettingDefinition {
    pub fn new(kind: SettingKind, category: Category) -> Self {
        Self {
            kind,
            category,
            label: kind.default_label().to_string(),
            default_value: category.empty_value(),
            is_static: category == Category::Static,
            policy: CustomPolicy::default(),
            codec: ValueCodec::Json,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = value.into();
        self
    }

    /// No available-value computation; always initialized and valid.
    pub fn static_setting(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn with_validator(
        mut self,
        validator: impl Fn(&Value, &AvailableValues) -> bool + 'static,
    ) -> Self {
        self.policy.validator = Some(Rc::new(validator));
        self
    }

    pub fn with_fixup(mut self, fixup: impl Fn(&Value, &AvailableValues) -> Value + 'static) -> Self {
        self.policy.fixup = Some(Rc::new(fixup));
        self
    }

    pub fn with_codec(mut self, codec: ValueCodec) -> Self {
        self.codec = codec;
        self
    }
}

impl fmt::Debug for SettingDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingDefinition")
            .field("kind", &self.kind)
            .field("category", &self.category)
            .field("label", &self.label)
            .field("default_value", &self.default_value)
            .field("is_static", &self.is_static)
            .field("custom_validator", &self.policy.validator.is_some())
            .field("custom_fixup", &self.policy.fixup.is_some())
            .field("codec", &self.codec)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone, Default)]
pub struct SettingRegistry {
    definitions: FxHashMap<SettingKind, SettingDefinition>,
}

impl SettingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition.
    ///
    /// Returns an error if the kind is already registered.
    pub fn register(&mut self, def: SettingDefinition) -> Result<(), EngineError> {
        if self.definitions.contains_key(&def.kind) {
            return Err(EngineError::DuplicateSetting(def.kind));
        }
        log::debug!("registered setting {} ({:?})", def.kind, def.category);
        self.definitions.insert(def.kind, def);
        Ok(())
    }

    pub fn get(&self, kind: SettingKind) -> Result<&SettingDefinition, EngineError> {
        self.definitions
            .get(&kind)
            .ok_or(EngineError::UnknownSetting(kind))
    }

    pub fn contains(&self, kind: SettingKind) -> bool {
        self.definitions.contains_key(&kind)
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<SettingKind> {
        let mut kinds: Vec<_> = self.definitions.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn create_setting(&self, kind: SettingKind) -> Result<Setting, EngineError> {
        self.get(kind).map(Setting::from_definition)
    }

    /// Definitions for the subsurface setting kinds.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for def in builtin_definitions() {
            registry.definitions.insert(def.kind, def);
        }
        registry
    }
}

impl fmt::Debug for SettingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// A sensitivity selection may be empty when the ensemble has no
/// sensitivities.
fn sensitivity_is_valid(value: &Value, available: &AvailableValues) -> bool {
    let options = available.as_options();
    if options.is_empty() {
        return value.is_null();
    }
    options.contains(value)
}

fn builtin_definitions() -> Vec<SettingDefinition> {
    use Category::*;
    use SettingKind as K;

    vec![
        SettingDefinition::new(K::Ensemble, SingleOption).with_codec(ValueCodec::ensemble_ident()),
        SettingDefinition::new(K::Realization, SingleOption),
        SettingDefinition::new(K::Realizations, MultiOption),
        SettingDefinition::new(K::Attribute, SingleOption),
        SettingDefinition::new(K::SurfaceName, SingleOption),
        SettingDefinition::new(K::TimeOrInterval, SingleOption),
        SettingDefinition::new(K::StatisticFunction, Static).with_default("MEAN"),
        SettingDefinition::new(K::Sensitivity, SingleOption).with_validator(sensitivity_is_valid),
        SettingDefinition::new(K::GridName, SingleOption),
        SettingDefinition::new(K::GridAttribute, SingleOption),
        SettingDefinition::new(K::GridLayerK, NumberWithStep),
        SettingDefinition::new(K::GridLayerKRange, Range),
        SettingDefinition::new(K::ShowGridLines, Boolean)
            .with_default(false)
            .static_setting(),
        SettingDefinition::new(K::SmdaWellboreHeaders, MultiOption),
        SettingDefinition::new(K::Intersection, SingleOption),
        SettingDefinition::new(K::SampleResolutionInMeters, Number)
            .with_default(1)
            .static_setting(),
        SettingDefinition::new(K::Opacity, Number)
            .with_default(100)
            .static_setting(),
    ]
}
