//! Layer definitions.
//!
//! A layer declares which settings it exposes and how their available values
//! are computed. `SettingsGraph::from_layer` turns a definition into a live,
//! initialized graph.

use strata_core::SettingKind;

use crate::error::EngineError;
use crate::graph::SettingsGraph;
use crate::setting::SettingsSnapshot;

pub trait LayerDefinition {
    /// Setting kinds in display order.
    fn settings(&self) -> Vec<SettingKind>;

    /// Register updaters and helpers on a freshly created graph.
    fn define_dependencies(&self, graph: &SettingsGraph) -> Result<(), EngineError>;

    /// Cross-setting check applied once every setting is individually valid.
    /// Returning false puts the graph in `Failed`.
    fn are_current_settings_valid(&self, _snapshot: &SettingsSnapshot) -> bool {
        true
    }
}
