//! Test harness for settings graphs with event tracking.
//!
//! `GraphHarness` bundles a graph with its global context, scheduler and an
//! attached `EventCollector`. `settle()` runs every ready task so tests can
//! step through asynchronous propagation deterministically.
//!
//! `Gates` hands out one channel per update-function run so a test decides
//! when (and in which order) runs complete.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;
use strata_config::EngineSettings;
use strata_core::{LoadingState, SettingKind};

use crate::events::{EventCollector, GraphEvent};
use crate::global::GlobalContext;
use crate::graph::SettingsGraph;
use crate::registry::SettingRegistry;
use crate::scheduler::Scheduler;

pub struct GraphHarness {
    pub global: Rc<GlobalContext>,
    pub scheduler: Scheduler,
    pub graph: SettingsGraph,
    pub events: EventCollector<GraphEvent>,
}

impl GraphHarness {
    pub fn new(kinds: &[SettingKind]) -> Self {
        Self::with_config(kinds, EngineSettings::default())
    }

    pub fn with_config(kinds: &[SettingKind], config: EngineSettings) -> Self {
        let global = Rc::new(GlobalContext::new());
        let scheduler = Scheduler::new();
        let graph = SettingsGraph::new(
            &SettingRegistry::builtin(),
            kinds,
            global.clone(),
            scheduler.clone(),
            config,
        )
        .unwrap();
        let events = EventCollector::new();
        graph.subscribe(events.sink());

        Self {
            global,
            scheduler,
            graph,
            events,
        }
    }

    /// Run ready tasks until nothing can progress.
    pub fn settle(&self) {
        self.scheduler.run_until_stalled();
    }

    pub fn value(&self, kind: SettingKind) -> Value {
        self.graph.value(kind).unwrap()
    }

    pub fn state(&self) -> LoadingState {
        self.graph.loading_state()
    }
}

/// One release channel per run, in creation order.
#[derive(Clone, Default)]
pub struct Gates {
    senders: Rc<RefCell<Vec<smol::channel::Sender<()>>>>,
}

impl Gates {
    /// Register a gate and return its index plus the receiver to await.
    pub fn open(&self) -> (usize, smol::channel::Receiver<()>) {
        let (tx, rx) = smol::channel::bounded(1);
        let mut senders = self.senders.borrow_mut();
        senders.push(tx);
        (senders.len() - 1, rx)
    }

    pub fn release(&self, index: usize) {
        let _ = self.senders.borrow()[index].try_send(());
    }

    /// Release the most recently opened gate.
    pub fn release_last(&self) {
        let last = self.len().saturating_sub(1);
        self.release(last);
    }

    pub fn len(&self) -> usize {
        self.senders.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use serde_json::json;
    use strata_core::{EnsembleIdent, EnsembleInfo, OverrideSource};

    use crate::category::AvailableValues;
    use crate::dependency::{UpdateContext, UpdateResult};
    use crate::error::{EngineError, UpdateError};
    use crate::events::GraphTopic;
    use crate::global::GlobalKey;
    use crate::overrides::{GroupOverrides, SharedSetting};
    use crate::updaters;

    type AvailableResult = Result<Option<AvailableValues>, UpdateError>;

    fn ident(name: &str) -> EnsembleIdent {
        EnsembleIdent::new("case-1", name)
    }

    fn options_updater(
        options: Vec<Value>,
    ) -> impl Fn(UpdateContext) -> std::future::Ready<AvailableResult> {
        move |_ctx| std::future::ready(Ok(Some(AvailableValues::options(options.clone()))))
    }

    fn seed_field(global: &GlobalContext) {
        global.set_field_id("F1");
        global
            .set_ensembles(&[
                EnsembleInfo::new(ident("A"), "F1").with_realizations(vec![0, 1, 2]),
                EnsembleInfo::new(ident("B"), "F2").with_realizations(vec![5]),
            ])
            .unwrap();
    }

    // ------------------------------------------------------------------
    // End-to-end scenarios
    // ------------------------------------------------------------------

    #[test]
    fn test_ensemble_resolves_to_first_option() {
        let h = GraphHarness::new(&[SettingKind::Ensemble]);
        seed_field(&h.global);
        h.graph
            .available_settings_updater(SettingKind::Ensemble, updaters::ensembles_for_field)
            .unwrap();

        h.graph.initialize();
        assert_eq!(h.state(), LoadingState::Loading);
        assert!(h.graph.setting(SettingKind::Ensemble).unwrap().is_loading());

        h.settle();
        assert_eq!(
            h.graph.value_as::<EnsembleIdent>(SettingKind::Ensemble).unwrap(),
            Some(ident("A"))
        );
        assert_eq!(h.state(), LoadingState::Loaded);
        assert_eq!(
            h.events.loading_transitions(),
            vec![(LoadingState::Loading, LoadingState::Loaded)]
        );
    }

    #[test]
    fn test_staged_setting_waits_for_upstream() {
        let h = GraphHarness::new(&[SettingKind::Ensemble, SettingKind::GridName]);
        // No field selected: the ensemble updater computes nothing
        h.graph
            .available_settings_updater(SettingKind::Ensemble, updaters::ensembles_for_field)
            .unwrap();
        h.graph
            .available_settings_updater(SettingKind::GridName, |ctx| async move {
                if ctx.get_local_setting(SettingKind::Ensemble).is_null() {
                    return AvailableResult::Ok(None);
                }
                Ok(Some(AvailableValues::options(["Geogrid"])))
            })
            .unwrap();

        h.graph.initialize();
        h.settle();

        let grid = h.graph.setting(SettingKind::GridName).unwrap();
        assert_eq!(grid.available_values(), &AvailableValues::Empty);
        assert!(!grid.is_initialized());
        assert_eq!(h.state(), LoadingState::Loading);
        assert!(h.events.loading_transitions().is_empty());
    }

    #[test]
    fn test_staged_helper_waits_for_realization() {
        let h = GraphHarness::new(&[
            SettingKind::Ensemble,
            SettingKind::Realization,
            SettingKind::GridName,
        ]);
        seed_field(&h.global);
        let gates = Gates::default();

        h.graph
            .available_settings_updater(SettingKind::Ensemble, updaters::ensembles_for_field)
            .unwrap();
        let g = gates.clone();
        h.graph
            .available_settings_updater(SettingKind::Realization, move |ctx| {
                let g = g.clone();
                async move {
                    let _ = ctx.get_local_setting(SettingKind::Ensemble);
                    let (_, rx) = g.open();
                    let _ = rx.recv().await;
                    updaters::realizations_for_ensemble(ctx).await
                }
            })
            .unwrap();
        let grids = h.graph.helper_dependency(|ctx| async move {
            let ensemble = ctx.get_local_setting_as::<EnsembleIdent>(SettingKind::Ensemble);
            let realization = ctx.get_local_setting_as::<u32>(SettingKind::Realization);
            let (Some(ensemble), Some(realization)) = (ensemble, realization) else {
                return UpdateResult::Ok(None);
            };
            Ok(Some(json!([format!("{}-r{realization}", ensemble.ensemble_name)])))
        });
        h.graph
            .available_settings_updater(SettingKind::GridName, move |ctx| async move {
                let names: Option<Vec<String>> = ctx.get_helper_dependency_as(grids);
                AvailableResult::Ok(names.map(AvailableValues::options))
            })
            .unwrap();

        h.graph.initialize();
        h.settle();
        assert_eq!(
            h.graph.value_as::<EnsembleIdent>(SettingKind::Ensemble).unwrap(),
            Some(ident("A"))
        );
        assert_eq!(h.value(SettingKind::Realization), Value::Null);
        assert_eq!(h.graph.dependency_value(grids), None);
        assert_eq!(
            h.graph.available_values(SettingKind::GridName).unwrap(),
            AvailableValues::Empty
        );
        assert_eq!(h.state(), LoadingState::Loading);

        gates.release_last();
        h.settle();
        assert_eq!(h.value(SettingKind::Realization), json!(0));
        assert_eq!(h.graph.dependency_value(grids), Some(json!(["A-r0"])));
        assert_eq!(h.value(SettingKind::GridName), json!("A-r0"));
        assert_eq!(h.state(), LoadingState::Loaded);
    }

    #[test]
    fn test_upstream_selection_releases_staged_setting() {
        let h = GraphHarness::new(&[SettingKind::Ensemble, SettingKind::GridName]);
        h.graph
            .available_settings_updater(SettingKind::Ensemble, updaters::ensembles_for_field)
            .unwrap();
        h.graph
            .available_settings_updater(SettingKind::GridName, |ctx| async move {
                match ctx.get_local_setting_as::<EnsembleIdent>(SettingKind::Ensemble) {
                    Some(ident) => Ok(Some(AvailableValues::options([format!(
                        "{}-grid",
                        ident.ensemble_name
                    )]))),
                    None => AvailableResult::Ok(None),
                }
            })
            .unwrap();
        h.graph.initialize();
        h.settle();
        assert_eq!(h.state(), LoadingState::Loading);

        seed_field(&h.global);
        h.settle();
        assert_eq!(h.value(SettingKind::GridName), json!("A-grid"));
        assert_eq!(h.state(), LoadingState::Loaded);
    }

    // ------------------------------------------------------------------
    // Propagation
    // ------------------------------------------------------------------

    #[test]
    fn test_unchanged_helper_value_is_not_propagated() {
        let h = GraphHarness::new(&[SettingKind::Ensemble, SettingKind::Realization]);
        let child_runs = Rc::new(Cell::new(0));

        let helper = h.graph.helper_dependency(|ctx| async move {
            let _ = ctx.get_local_setting(SettingKind::Ensemble);
            UpdateResult::Ok(Some(json!(["constant"])))
        });
        let runs = child_runs.clone();
        h.graph
            .available_settings_updater(SettingKind::Realization, move |ctx| {
                let runs = runs.clone();
                async move {
                    runs.set(runs.get() + 1);
                    let _ = ctx.get_helper_dependency(helper);
                    AvailableResult::Ok(Some(AvailableValues::options([1, 2])))
                }
            })
            .unwrap();

        h.graph.initialize();
        h.settle();
        // Discovery pass plus one real run
        assert_eq!(child_runs.get(), 2);

        h.graph.set_value(SettingKind::Ensemble, json!("other")).unwrap();
        h.settle();
        assert_eq!(child_runs.get(), 2);
        assert_eq!(h.events.dependency_values(helper).len(), 1);
    }

    #[test]
    fn test_child_is_loading_while_helper_runs() {
        let h = GraphHarness::new(&[SettingKind::Realization]);
        let gates = Gates::default();

        let g = gates.clone();
        let helper = h.graph.helper_dependency(move |_ctx| {
            let g = g.clone();
            async move {
                let (_, rx) = g.open();
                let _ = rx.recv().await;
                UpdateResult::Ok(Some(json!([7, 8])))
            }
        });
        let child = h
            .graph
            .available_settings_updater(SettingKind::Realization, move |ctx| async move {
                let values: Vec<u32> = ctx.get_helper_dependency_as(helper).unwrap_or_default();
                AvailableResult::Ok(Some(AvailableValues::options(values)))
            })
            .unwrap();

        h.graph.initialize();
        h.settle();
        assert!(h.graph.is_dependency_loading(helper));
        assert!(h.graph.is_dependency_loading(child));
        assert!(h.graph.setting(SettingKind::Realization).unwrap().is_loading());

        // Gate 0 belongs to the discovery pass
        gates.release(1);
        h.settle();
        assert!(!h.graph.is_dependency_loading(child));
        assert_eq!(h.value(SettingKind::Realization), json!(7));
        assert_eq!(h.state(), LoadingState::Loaded);
    }

    #[test]
    fn test_dependency_loading_transitions() {
        let h = GraphHarness::new(&[SettingKind::Realization]);
        let gates = Gates::default();

        let g = gates.clone();
        let helper = h.graph.helper_dependency(move |_ctx| {
            let g = g.clone();
            async move {
                let (_, rx) = g.open();
                let _ = rx.recv().await;
                UpdateResult::Ok(Some(json!([3, 4])))
            }
        });
        let child = h
            .graph
            .available_settings_updater(SettingKind::Realization, move |ctx| async move {
                let values: Vec<u32> = ctx.get_helper_dependency_as(helper).unwrap_or_default();
                AvailableResult::Ok(Some(AvailableValues::options(values)))
            })
            .unwrap();

        let helper_seen: Rc<RefCell<Vec<(bool, bool)>>> = Rc::default();
        let child_seen: Rc<RefCell<Vec<(bool, bool)>>> = Rc::default();
        let s = helper_seen.clone();
        h.graph.subscribe_dependency_loading(helper, move |loading, has_children| {
            s.borrow_mut().push((loading, has_children))
        });
        let s = child_seen.clone();
        h.graph.subscribe_dependency_loading(child, move |loading, has_children| {
            s.borrow_mut().push((loading, has_children))
        });

        h.graph.initialize();
        h.settle();
        assert_eq!(*helper_seen.borrow(), vec![(true, true)]);
        assert_eq!(*child_seen.borrow(), vec![(true, false)]);

        gates.release_last();
        h.settle();
        assert_eq!(*helper_seen.borrow(), vec![(true, true), (false, true)]);
        // No flicker between the helper finishing and the child's own run
        assert_eq!(*child_seen.borrow(), vec![(true, false), (false, false)]);
        assert_eq!(h.value(SettingKind::Realization), json!(3));
    }

    #[test]
    fn test_dependency_added_after_initialize_runs() {
        let h = GraphHarness::new(&[SettingKind::GridName]);
        let helper = h.graph.helper_dependency(|_ctx| async {
            UpdateResult::Ok(Some(json!(["g1", "g2"])))
        });
        h.graph.initialize();
        h.settle();
        assert_eq!(h.graph.dependency_value(helper), Some(json!(["g1", "g2"])));
        assert_eq!(h.state(), LoadingState::Loading);

        h.graph
            .available_settings_updater(SettingKind::GridName, move |ctx| async move {
                let names: Vec<String> = ctx.get_helper_dependency_as(helper).unwrap_or_default();
                AvailableResult::Ok(Some(AvailableValues::options(names)))
            })
            .unwrap();
        h.settle();

        assert!(h.graph.setting(SettingKind::GridName).unwrap().is_initialized());
        assert_eq!(h.value(SettingKind::GridName), json!("g1"));
        assert_eq!(h.state(), LoadingState::Loaded);
    }

    #[test]
    fn test_superseded_run_is_discarded() {
        let h = GraphHarness::new(&[SettingKind::Ensemble, SettingKind::GridName]);
        let gates = Gates::default();
        let observed: Rc<RefCell<Vec<bool>>> = Rc::default();

        let (g, seen) = (gates.clone(), observed.clone());
        h.graph
            .available_settings_updater(SettingKind::GridName, move |ctx| {
                let (g, seen) = (g.clone(), seen.clone());
                async move {
                    let _ = ctx.get_local_setting(SettingKind::Ensemble);
                    let (n, rx) = g.open();
                    let _ = rx.recv().await;
                    seen.borrow_mut().push(ctx.is_cancelled());
                    AvailableResult::Ok(Some(AvailableValues::options([format!("run{n}")])))
                }
            })
            .unwrap();

        h.graph.initialize();
        h.settle();
        assert_eq!(gates.len(), 2);

        h.graph.set_value(SettingKind::Ensemble, json!("e2")).unwrap();
        h.settle();
        assert_eq!(gates.len(), 3);

        gates.release(1);
        h.settle();
        assert!(!h.graph.setting(SettingKind::GridName).unwrap().is_initialized());

        gates.release(2);
        h.settle();
        assert_eq!(h.value(SettingKind::GridName), json!("run2"));
        assert_eq!(*observed.borrow(), vec![true, false]);
    }

    #[test]
    fn test_guarded_run_stops_on_cancel() {
        let h = GraphHarness::new(&[SettingKind::Ensemble, SettingKind::GridName]);
        let gates = Gates::default();
        let finished = Rc::new(Cell::new(0));

        let (g, done) = (gates.clone(), finished.clone());
        h.graph
            .available_settings_updater(SettingKind::GridName, move |ctx| {
                let (g, done) = (g.clone(), done.clone());
                async move {
                    let _ = ctx.get_local_setting(SettingKind::Ensemble);
                    let (_, rx) = g.open();
                    let _ = ctx.cancellation().guard(rx.recv()).await?;
                    done.set(done.get() + 1);
                    AvailableResult::Ok(Some(AvailableValues::options(["g"])))
                }
            })
            .unwrap();

        h.graph.initialize();
        h.settle();
        h.graph.set_value(SettingKind::Ensemble, json!("e2")).unwrap();
        h.settle();
        assert_eq!(finished.get(), 0);

        gates.release(2);
        h.settle();
        assert_eq!(finished.get(), 1);
        assert_eq!(h.value(SettingKind::GridName), json!("g"));
    }

    #[test]
    fn test_global_change_reruns_reader() {
        let h = GraphHarness::new(&[SettingKind::Ensemble]);
        seed_field(&h.global);
        let runs = Rc::new(Cell::new(0));

        let r = runs.clone();
        h.graph
            .available_settings_updater(SettingKind::Ensemble, move |ctx| {
                r.set(r.get() + 1);
                updaters::ensembles_for_field(ctx)
            })
            .unwrap();
        h.graph.initialize();
        h.settle();
        let after_init = runs.get();

        h.global.set(GlobalKey::RealizationFilter, json!({"x": [1]}));
        h.settle();
        assert_eq!(runs.get(), after_init);

        h.global.set_field_id("F2");
        h.settle();
        assert_eq!(runs.get(), after_init + 1);
        assert_eq!(
            h.graph.value_as::<EnsembleIdent>(SettingKind::Ensemble).unwrap(),
            Some(ident("B"))
        );
    }

    #[test]
    fn test_settings_changed_is_coalesced() {
        let h = GraphHarness::new(&[SettingKind::Realization, SettingKind::GridName]);
        h.graph
            .available_settings_updater(SettingKind::Realization, options_updater(vec![json!(1), json!(2)]))
            .unwrap();
        h.graph
            .available_settings_updater(SettingKind::GridName, options_updater(vec![json!("g")]))
            .unwrap();
        h.graph.initialize();
        h.settle();
        h.events.clear();

        h.graph.set_value(SettingKind::Realization, json!(2)).unwrap();
        assert_eq!(h.events.count_topic(GraphTopic::SettingsChanged), 1);
        assert_eq!(h.events.value_changes(SettingKind::Realization), vec![json!(2)]);
    }

    #[test]
    fn test_failed_run_propagates_absence() {
        let h = GraphHarness::new(&[SettingKind::Ensemble, SettingKind::GridName]);
        let handle = h
            .graph
            .available_settings_updater(SettingKind::GridName, |ctx| async move {
                if ctx.get_local_setting(SettingKind::Ensemble) == json!("bad") {
                    return Err(UpdateError::failed("backend unavailable"));
                }
                AvailableResult::Ok(Some(AvailableValues::options(["g1"])))
            })
            .unwrap();
        h.graph.initialize();
        h.settle();
        assert_eq!(h.value(SettingKind::GridName), json!("g1"));

        h.graph.set_value(SettingKind::Ensemble, json!("bad")).unwrap();
        h.settle();
        assert_eq!(h.graph.dependency_value(handle), None);
        let grid = h.graph.setting(SettingKind::GridName).unwrap();
        assert_eq!(grid.available_values(), &AvailableValues::Empty);
        assert!(!grid.is_valid());
    }

    // ------------------------------------------------------------------
    // Aggregate state
    // ------------------------------------------------------------------

    #[test]
    fn test_rejected_persisted_value_fails_until_edited() {
        let h = GraphHarness::new(&[SettingKind::SurfaceName]);
        h.graph
            .available_settings_updater(SettingKind::SurfaceName, options_updater(vec![json!("a"), json!("b")]))
            .unwrap();
        h.graph.deserialize_value(SettingKind::SurfaceName, "\"z\"").unwrap();

        h.graph.initialize();
        h.settle();
        assert_eq!(h.state(), LoadingState::Failed);
        assert_eq!(h.value(SettingKind::SurfaceName), json!("z"));
        assert_eq!(h.graph.invalid_settings(), vec!["Surface name".to_string()]);

        h.graph.set_value(SettingKind::SurfaceName, json!("b")).unwrap();
        assert_eq!(h.state(), LoadingState::Loaded);
        assert!(h.graph.invalid_settings().is_empty());
    }

    #[test]
    fn test_valid_persisted_value_is_kept() {
        let h = GraphHarness::new(&[SettingKind::SurfaceName]);
        h.graph
            .available_settings_updater(SettingKind::SurfaceName, options_updater(vec![json!("a"), json!("b")]))
            .unwrap();
        h.graph.deserialize_value(SettingKind::SurfaceName, "\"b\"").unwrap();
        h.graph.initialize();
        h.settle();

        assert_eq!(h.value(SettingKind::SurfaceName), json!("b"));
        assert!(h.graph.setting(SettingKind::SurfaceName).unwrap().is_persisted());
        assert_eq!(h.state(), LoadingState::Loaded);
    }

    #[test]
    fn test_settings_validator_can_fail_graph() {
        let h = GraphHarness::new(&[SettingKind::GridLayerKRange]);
        h.graph
            .available_settings_updater(SettingKind::GridLayerKRange, |_ctx| async {
                AvailableResult::Ok(Some(AvailableValues::stepped(0.0, 10.0, 1.0)))
            })
            .unwrap();
        h.graph.set_settings_validator(|snapshot| {
            snapshot
                .get_as::<[i64; 2]>(SettingKind::GridLayerKRange)
                .is_some_and(|[lo, hi]| hi - lo < 5)
        });
        h.graph.initialize();
        h.settle();
        assert_eq!(h.value(SettingKind::GridLayerKRange), json!([0, 10]));
        assert_eq!(h.state(), LoadingState::Failed);

        h.graph.set_value(SettingKind::GridLayerKRange, json!([2, 4])).unwrap();
        assert_eq!(h.state(), LoadingState::Loaded);
    }

    #[test]
    fn test_unread_stored_data_holds_loading() {
        let h = GraphHarness::new(&[SettingKind::Opacity]);
        let gates = Gates::default();
        let g = gates.clone();
        h.graph.stored_data_updater("surfaceMeta", move |_ctx| {
            let g = g.clone();
            async move {
                let (_, rx) = g.open();
                let _ = rx.recv().await;
                UpdateResult::Ok(Some(json!({"zRange": [0, 100]})))
            }
        });

        h.graph.initialize();
        h.settle();
        assert_eq!(h.state(), LoadingState::Loading);

        gates.release(1);
        h.settle();
        assert_eq!(h.state(), LoadingState::Loaded);
        assert_eq!(
            h.graph.stored_data("surfaceMeta"),
            Some(json!({"zRange": [0, 100]}))
        );
    }

    #[test]
    fn test_child_subscriber_releases_stored_data_loading() {
        let h = GraphHarness::new(&[SettingKind::Opacity]);
        let gates = Gates::default();
        let g = gates.clone();
        let handle = h.graph.stored_data_updater("surfaceMeta", move |_ctx| {
            let g = g.clone();
            async move {
                let (_, rx) = g.open();
                let _ = rx.recv().await;
                UpdateResult::Ok(Some(json!(1)))
            }
        });
        let seen: Rc<RefCell<Vec<Option<Value>>>> = Rc::default();
        let s = seen.clone();
        h.graph
            .subscribe_dependency(handle, true, move |v| s.borrow_mut().push(v.cloned()));

        h.graph.initialize();
        h.settle();
        assert_eq!(h.state(), LoadingState::Loaded);

        gates.release(1);
        h.settle();
        assert_eq!(*seen.borrow(), vec![Some(json!(1))]);
    }

    #[test]
    fn test_late_child_subscriber_reclassifies_immediately() {
        let h = GraphHarness::new(&[SettingKind::Opacity]);
        let gates = Gates::default();
        let g = gates.clone();
        let handle = h.graph.stored_data_updater("surfaceMeta", move |_ctx| {
            let g = g.clone();
            async move {
                let (_, rx) = g.open();
                let _ = rx.recv().await;
                UpdateResult::Ok(Some(json!(1)))
            }
        });
        h.graph.initialize();
        h.settle();
        assert_eq!(h.state(), LoadingState::Loading);

        let id = h.graph.subscribe_dependency(handle, true, |_| {});
        assert_eq!(h.state(), LoadingState::Loaded);
        assert_eq!(
            h.events.loading_transitions(),
            vec![(LoadingState::Loading, LoadingState::Loaded)]
        );

        assert!(h.graph.unsubscribe(id));
        assert_eq!(h.state(), LoadingState::Loading);
        assert_eq!(
            h.events.loading_transitions().last(),
            Some(&(LoadingState::Loaded, LoadingState::Loading))
        );
    }

    #[test]
    fn test_edit_under_override_is_silent() {
        let h = GraphHarness::new(&[SettingKind::Realization]);
        h.graph
            .available_settings_updater(SettingKind::Realization, options_updater(vec![json!(1), json!(2), json!(3)]))
            .unwrap();
        h.graph.initialize();
        h.settle();
        let group = GroupOverrides::new().with(SettingKind::Realization, 3);
        h.graph.check_for_overrides(&[&group]);
        h.events.clear();

        h.graph.set_value(SettingKind::Realization, json!(2)).unwrap();
        assert!(h.events.value_changes(SettingKind::Realization).is_empty());
        assert_eq!(h.events.count_topic(GraphTopic::SettingsChanged), 0);
        assert_eq!(h.value(SettingKind::Realization), json!(3));

        h.graph.check_for_overrides(&[]);
        assert_eq!(h.value(SettingKind::Realization), json!(2));
    }

    // ------------------------------------------------------------------
    // Overrides
    // ------------------------------------------------------------------

    #[test]
    fn test_group_override_takes_precedence() {
        let h = GraphHarness::new(&[SettingKind::Realization]);
        h.graph
            .available_settings_updater(SettingKind::Realization, options_updater(vec![json!(1), json!(2), json!(3)]))
            .unwrap();
        h.graph.initialize();
        h.settle();
        h.graph.set_value(SettingKind::Realization, json!(2)).unwrap();

        let group = GroupOverrides::new().with(SettingKind::Realization, 3);
        h.graph.check_for_overrides(&[&group]);
        let setting = h.graph.setting(SettingKind::Realization).unwrap();
        assert_eq!(setting.value(), &json!(3));
        assert_eq!(setting.override_source(), OverrideSource::Group);

        h.graph.check_for_overrides(&[]);
        assert_eq!(h.value(SettingKind::Realization), json!(2));
        assert_eq!(
            h.graph.setting(SettingKind::Realization).unwrap().override_source(),
            OverrideSource::None
        );
    }

    #[test]
    fn test_nearest_provider_wins() {
        let h = GraphHarness::new(&[SettingKind::Realization]);
        let near = GroupOverrides::new().with(SettingKind::Realization, 1);
        let far = GroupOverrides::new().with(SettingKind::Realization, 9);
        h.graph.check_for_overrides(&[&near, &far]);
        assert_eq!(h.value(SettingKind::Realization), json!(1));
    }

    #[test]
    fn test_shared_setting_drives_members() {
        let registry = SettingRegistry::builtin();
        let a = GraphHarness::new(&[SettingKind::Realization]);
        let b = GraphHarness::new(&[SettingKind::Realization]);
        a.graph
            .available_settings_updater(SettingKind::Realization, options_updater(vec![json!(1), json!(2), json!(3)]))
            .unwrap();
        b.graph
            .available_settings_updater(SettingKind::Realization, options_updater(vec![json!(2), json!(3), json!(4)]))
            .unwrap();
        for h in [&a, &b] {
            h.graph.initialize();
            h.settle();
        }

        let mut shared = SharedSetting::new(&registry, SettingKind::Realization).unwrap();
        shared.refresh(&[&a.graph, &b.graph]);
        assert_eq!(
            shared.setting().available_values(),
            &AvailableValues::options([2, 3])
        );
        assert_eq!(shared.value(), &json!(2));

        for h in [&a, &b] {
            h.graph.check_for_overrides(&[&shared]);
            assert_eq!(h.value(SettingKind::Realization), json!(2));
            assert_eq!(
                h.graph.setting(SettingKind::Realization).unwrap().override_source(),
                OverrideSource::SharedSetting
            );
        }
    }

    // ------------------------------------------------------------------
    // Construction and teardown
    // ------------------------------------------------------------------

    #[test]
    fn test_construction_errors() {
        let registry = SettingRegistry::builtin();
        let global = Rc::new(GlobalContext::new());
        let err = SettingsGraph::new(
            &registry,
            &[SettingKind::Ensemble, SettingKind::Ensemble],
            global.clone(),
            Scheduler::new(),
            EngineSettings::default(),
        )
        .unwrap_err();
        assert_eq!(err, EngineError::DuplicateSettingInGraph(SettingKind::Ensemble));

        let err = SettingsGraph::new(
            &SettingRegistry::new(),
            &[SettingKind::Ensemble],
            global,
            Scheduler::new(),
            EngineSettings::default(),
        )
        .unwrap_err();
        assert_eq!(err, EngineError::UnknownSetting(SettingKind::Ensemble));
    }

    #[test]
    fn test_updater_wiring_errors() {
        let h = GraphHarness::new(&[SettingKind::ShowGridLines]);
        let err = h
            .graph
            .available_settings_updater(SettingKind::ShowGridLines, options_updater(vec![]))
            .unwrap_err();
        assert_eq!(err, EngineError::StaticSettingHasNoUpdater(SettingKind::ShowGridLines));

        let err = h
            .graph
            .available_settings_updater(SettingKind::Ensemble, options_updater(vec![]))
            .unwrap_err();
        assert_eq!(err, EngineError::SettingNotInGraph(SettingKind::Ensemble));
    }

    #[test]
    fn test_static_only_graph_is_loaded() {
        let h = GraphHarness::new(&[SettingKind::ShowGridLines, SettingKind::Opacity]);
        h.graph.initialize();
        assert_eq!(h.state(), LoadingState::Loaded);
        assert_eq!(h.value(SettingKind::Opacity), json!(100));
    }

    #[test]
    fn test_reading_foreign_setting_yields_null() {
        let h = GraphHarness::new(&[SettingKind::GridName]);
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        h.graph
            .available_settings_updater(SettingKind::GridName, move |ctx| {
                let s = s.clone();
                async move {
                    *s.borrow_mut() = Some(ctx.get_local_setting(SettingKind::Ensemble));
                    AvailableResult::Ok(None)
                }
            })
            .unwrap();
        h.graph.initialize();
        h.settle();
        assert_eq!(*seen.borrow(), Some(Value::Null));
    }

    #[test]
    fn test_drop_cancels_in_flight_runs() {
        let h = GraphHarness::new(&[SettingKind::GridName]);
        let gates = Gates::default();
        let observed: Rc<RefCell<Vec<bool>>> = Rc::default();

        let (g, seen) = (gates.clone(), observed.clone());
        h.graph
            .available_settings_updater(SettingKind::GridName, move |ctx| {
                let (g, seen) = (g.clone(), seen.clone());
                async move {
                    let _ = ctx.get_global_setting(GlobalKey::FieldId);
                    let (_, rx) = g.open();
                    let _ = rx.recv().await;
                    seen.borrow_mut().push(ctx.is_cancelled());
                    AvailableResult::Ok(None)
                }
            })
            .unwrap();
        h.graph.initialize();
        h.settle();
        assert_eq!(h.global.subscriber_count(), 1);

        let GraphHarness {
            global,
            scheduler,
            graph,
            ..
        } = h;
        drop(graph);
        assert_eq!(global.subscriber_count(), 0);

        gates.release(1);
        scheduler.run_until_stalled();
        assert_eq!(*observed.borrow(), vec![true]);

        // Global changes no longer reach the dropped graph
        global.set_field_id("F9");
        assert!(!scheduler.run_until_stalled());
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    #[test]
    fn test_state_round_trip() {
        let h = GraphHarness::new(&[SettingKind::Ensemble, SettingKind::Realization]);
        seed_field(&h.global);
        h.graph
            .available_settings_updater(SettingKind::Ensemble, updaters::ensembles_for_field)
            .unwrap();
        h.graph
            .available_settings_updater(SettingKind::Realization, updaters::realizations_for_ensemble)
            .unwrap();
        h.graph.initialize();
        h.settle();
        h.graph.set_value(SettingKind::Realization, json!(2)).unwrap();

        let state = h.graph.serialize_state();
        assert_eq!(state["ENSEMBLE"], "case-1::A");
        assert_eq!(state["REALIZATION"], "2");

        let restored = GraphHarness::new(&[SettingKind::Ensemble, SettingKind::Realization]);
        seed_field(&restored.global);
        restored
            .graph
            .available_settings_updater(SettingKind::Ensemble, updaters::ensembles_for_field)
            .unwrap();
        restored
            .graph
            .available_settings_updater(SettingKind::Realization, updaters::realizations_for_ensemble)
            .unwrap();
        restored.graph.deserialize_state(&state).unwrap();
        restored.graph.initialize();
        restored.settle();

        assert_eq!(restored.value(SettingKind::Realization), json!(2));
        assert_eq!(restored.state(), LoadingState::Loaded);
    }

    #[test]
    fn test_restore_can_be_disabled() {
        let config = EngineSettings {
            restore_persisted_values: false,
            ..EngineSettings::default()
        };
        let h = GraphHarness::with_config(&[SettingKind::Realization], config);
        let state = [("REALIZATION".to_string(), "5".to_string())].into_iter().collect();
        h.graph.deserialize_state(&state).unwrap();
        assert_eq!(h.value(SettingKind::Realization), Value::Null);
    }

    #[test]
    fn test_restore_reports_undecodable_entry() {
        let h = GraphHarness::new(&[SettingKind::Ensemble, SettingKind::Realization]);
        let state = [
            ("ENSEMBLE".to_string(), "not-an-ident".to_string()),
            ("REALIZATION".to_string(), "3".to_string()),
            ("NOT_A_KIND".to_string(), "1".to_string()),
        ]
        .into_iter()
        .collect();

        let err = h.graph.deserialize_state(&state).unwrap_err();
        assert!(matches!(err, EngineError::Deserialize { kind: SettingKind::Ensemble, .. }));
        assert_eq!(h.value(SettingKind::Realization), json!(3));
    }
}
