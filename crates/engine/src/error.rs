//! Error types.
//!
//! Only programmer errors surface as `EngineError`: registering a kind twice,
//! looking up an unregistered kind, or wiring an updater to a setting the
//! graph does not own. Data-dependent conditions (missing selections, empty
//! intersections, stale persisted values) are graph states, not errors.

use std::fmt;

use strata_core::SettingKind;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A definition for this kind is already registered.
    DuplicateSetting(SettingKind),
    /// No definition is registered for this kind.
    UnknownSetting(SettingKind),
    /// The kind was listed twice when constructing a graph.
    DuplicateSettingInGraph(SettingKind),
    /// The graph does not own a setting of this kind.
    SettingNotInGraph(SettingKind),
    /// Static settings have no available-value computation.
    StaticSettingHasNoUpdater(SettingKind),
    /// A persisted string could not be decoded into a value.
    Deserialize { kind: SettingKind, message: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateSetting(kind) => write!(f, "setting '{kind}' is already registered"),
            Self::UnknownSetting(kind) => write!(f, "setting '{kind}' is not registered"),
            Self::DuplicateSettingInGraph(kind) => {
                write!(f, "setting '{kind}' listed more than once")
            }
            Self::SettingNotInGraph(kind) => write!(f, "setting '{kind}' is not part of this graph"),
            Self::StaticSettingHasNoUpdater(kind) => {
                write!(f, "setting '{kind}' is static and cannot have an updater")
            }
            Self::Deserialize { kind, message } => {
                write!(f, "cannot deserialize value for '{kind}': {message}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// Outcome of an update function that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// The run observed its cancellation token. Always silent.
    Cancelled,
    /// The computation failed. Treated as "computed nothing".
    Failed(String),
}

impl UpdateError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<serde_json::Error> for UpdateError {
    fn from(e: serde_json::Error) -> Self {
        Self::Failed(e.to_string())
    }
}
