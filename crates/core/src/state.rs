//! Aggregate states shared by the engine and its consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Graph-wide classification derived from all settings' individual states.
///
/// Owning layers refetch data only on a transition into `Loaded`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadingState {
    /// At least one setting is not initialized or is still loading.
    #[default]
    Loading,
    /// Everything is loaded, initialized and valid.
    Loaded,
    /// Everything is loaded but at least one setting is invalid.
    Failed,
}

impl fmt::Display for LoadingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadingState::Loading => write!(f, "LOADING"),
            LoadingState::Loaded => write!(f, "LOADED"),
            LoadingState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Where a setting's override value comes from.
///
/// A group override locks the value; a shared setting drives it from the
/// intersection of its members. Consumers render the two differently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideSource {
    #[default]
    None,
    Group,
    SharedSetting,
}

impl OverrideSource {
    pub fn is_overridden(&self) -> bool {
        !matches!(self, OverrideSource::None)
    }
}
