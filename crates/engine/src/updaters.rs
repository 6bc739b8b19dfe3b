//! Update functions shared by most layers.

use std::collections::BTreeMap;

use strata_core::{EnsembleIdent, EnsembleInfo, SettingKind};

use crate::category::AvailableValues;
use crate::dependency::UpdateContext;
use crate::error::UpdateError;
use crate::global::GlobalKey;

/// Ensembles loaded for the active field. Absent until a field is selected.
pub async fn ensembles_for_field(ctx: UpdateContext) -> Result<Option<AvailableValues>, UpdateError> {
    let Some(field) = ctx.get_global_setting_as::<String>(GlobalKey::FieldId) else {
        return Ok(None);
    };
    let ensembles: Vec<EnsembleInfo> = ctx
        .get_global_setting_as(GlobalKey::Ensembles)
        .unwrap_or_default();

    let idents: Vec<EnsembleIdent> = ensembles
        .into_iter()
        .filter(|e| e.field_identifier == field)
        .map(|e| e.ident)
        .collect();
    Ok(Some(AvailableValues::options_from(&idents)?))
}

/// Realizations of the selected ensemble, narrowed by the realization filter
/// when it has an entry for that ensemble. Absent until an ensemble is
/// selected.
pub async fn realizations_for_ensemble(
    ctx: UpdateContext,
) -> Result<Option<AvailableValues>, UpdateError> {
    let Some(ident) = ctx.get_local_setting_as::<EnsembleIdent>(SettingKind::Ensemble) else {
        return Ok(None);
    };
    let ensembles: Vec<EnsembleInfo> = ctx
        .get_global_setting_as(GlobalKey::Ensembles)
        .unwrap_or_default();
    let filter: BTreeMap<String, Vec<u32>> = ctx
        .get_global_setting_as(GlobalKey::RealizationFilter)
        .unwrap_or_default();

    let Some(info) = ensembles.into_iter().find(|e| e.ident == ident) else {
        return Ok(Some(AvailableValues::Empty));
    };

    let allowed = filter.get(&ident.to_string());
    let realizations: Vec<u32> = info
        .realizations
        .into_iter()
        .filter(|r| allowed.map_or(true, |a| a.contains(r)))
        .collect();
    Ok(Some(AvailableValues::options(realizations)))
}
