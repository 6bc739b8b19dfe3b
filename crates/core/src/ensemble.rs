//! Ensemble identity.
//!
//! Ensembles are the unit of model data selection: a case (by uuid) plus an
//! ensemble name within that case. The global context publishes the list of
//! loaded ensembles as `EnsembleInfo`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used by the compact string form (`<case uuid>::<ensemble name>`).
pub const IDENT_SEPARATOR: &str = "::";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleIdent {
    pub case_uuid: String,
    pub ensemble_name: String,
}

impl EnsembleIdent {
    pub fn new(case_uuid: impl Into<String>, ensemble_name: impl Into<String>) -> Self {
        Self {
            case_uuid: case_uuid.into(),
            ensemble_name: ensemble_name.into(),
        }
    }

    /// Parse the compact string form. Returns `None` if the separator is missing
    /// or either part is empty.
    pub fn parse(s: &str) -> Option<Self> {
        let (case_uuid, ensemble_name) = s.split_once(IDENT_SEPARATOR)?;
        if case_uuid.is_empty() || ensemble_name.is_empty() {
            return None;
        }
        Some(Self::new(case_uuid, ensemble_name))
    }
}

impl fmt::Display for EnsembleIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.case_uuid, IDENT_SEPARATOR, self.ensemble_name)
    }
}

/// An ensemble as published by the global context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleInfo {
    pub ident: EnsembleIdent,
    pub field_identifier: String,
    #[serde(default)]
    pub realizations: Vec<u32>,
}

impl EnsembleInfo {
    pub fn new(ident: EnsembleIdent, field_identifier: impl Into<String>) -> Self {
        Self {
            ident,
            field_identifier: field_identifier.into(),
            realizations: Vec::new(),
        }
    }

    pub fn with_realizations(mut self, realizations: Vec<u32>) -> Self {
        self.realizations = realizations;
        self
    }
}
