//! Setting kinds.
//!
//! A `SettingKind` names one configurable value slot a layer can expose.
//! The same kind appearing on several layers is what makes shared settings
//! and group overrides possible: overrides are matched by kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a setting slot.
///
/// The string form (`as_str`) is stable and is used as the key in
/// serialized layer state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettingKind {
    Ensemble,
    Realization,
    Realizations,
    Attribute,
    SurfaceName,
    TimeOrInterval,
    StatisticFunction,
    Sensitivity,
    GridName,
    GridAttribute,
    GridLayerK,
    GridLayerKRange,
    ShowGridLines,
    SmdaWellboreHeaders,
    Intersection,
    SampleResolutionInMeters,
    Opacity,
}

impl SettingKind {
    /// All kinds, in declaration order.
    pub const ALL: [SettingKind; 17] = [
        SettingKind::Ensemble,
        SettingKind::Realization,
        SettingKind::Realizations,
        SettingKind::Attribute,
        SettingKind::SurfaceName,
        SettingKind::TimeOrInterval,
        SettingKind::StatisticFunction,
        SettingKind::Sensitivity,
        SettingKind::GridName,
        SettingKind::GridAttribute,
        SettingKind::GridLayerK,
        SettingKind::GridLayerKRange,
        SettingKind::ShowGridLines,
        SettingKind::SmdaWellboreHeaders,
        SettingKind::Intersection,
        SettingKind::SampleResolutionInMeters,
        SettingKind::Opacity,
    ];

    /// Stable identifier used in serialized state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKind::Ensemble => "ENSEMBLE",
            SettingKind::Realization => "REALIZATION",
            SettingKind::Realizations => "REALIZATIONS",
            SettingKind::Attribute => "ATTRIBUTE",
            SettingKind::SurfaceName => "SURFACE_NAME",
            SettingKind::TimeOrInterval => "TIME_OR_INTERVAL",
            SettingKind::StatisticFunction => "STATISTIC_FUNCTION",
            SettingKind::Sensitivity => "SENSITIVITY",
            SettingKind::GridName => "GRID_NAME",
            SettingKind::GridAttribute => "GRID_ATTRIBUTE",
            SettingKind::GridLayerK => "GRID_LAYER_K",
            SettingKind::GridLayerKRange => "GRID_LAYER_K_RANGE",
            SettingKind::ShowGridLines => "SHOW_GRID_LINES",
            SettingKind::SmdaWellboreHeaders => "SMDA_WELLBORE_HEADERS",
            SettingKind::Intersection => "INTERSECTION",
            SettingKind::SampleResolutionInMeters => "SAMPLE_RESOLUTION_IN_METERS",
            SettingKind::Opacity => "OPACITY",
        }
    }

    /// Default human-readable label.
    pub fn default_label(&self) -> &'static str {
        match self {
            SettingKind::Ensemble => "Ensemble",
            SettingKind::Realization => "Realization",
            SettingKind::Realizations => "Realizations",
            SettingKind::Attribute => "Attribute",
            SettingKind::SurfaceName => "Surface name",
            SettingKind::TimeOrInterval => "Date",
            SettingKind::StatisticFunction => "Statistic",
            SettingKind::Sensitivity => "Sensitivity",
            SettingKind::GridName => "Grid name",
            SettingKind::GridAttribute => "Grid attribute",
            SettingKind::GridLayerK => "Grid layer K",
            SettingKind::GridLayerKRange => "Grid layer K range",
            SettingKind::ShowGridLines => "Show grid lines",
            SettingKind::SmdaWellboreHeaders => "Wellbores",
            SettingKind::Intersection => "Intersection",
            SettingKind::SampleResolutionInMeters => "Sample resolution (m)",
            SettingKind::Opacity => "Opacity",
        }
    }
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown setting kind identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKindError(pub String);

impl fmt::Display for UnknownKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown setting kind: {}", self.0)
    }
}

impl std::error::Error for UnknownKindError {}

impl FromStr for SettingKind {
    type Err = UnknownKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKindError(s.to_string()))
    }
}
