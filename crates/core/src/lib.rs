//! Shared vocabulary for the settings engine and its consumers.

pub mod ensemble;
pub mod kind;
pub mod state;

pub use ensemble::{EnsembleIdent, EnsembleInfo};
pub use kind::{SettingKind, UnknownKindError};
pub use state::{LoadingState, OverrideSource};
