//! Settings graph.
//!
//! A `SettingsGraph` owns the settings of one layer (or group) and the
//! dependencies that compute their available values. It is the only thing
//! that mutates them, and the only thing that emits their events.
//!
//! ## Propagation
//!
//! All mutations funnel through one loop (`GraphShared::pump`):
//!
//! 1. Setting changes and dependency emissions schedule dependents into a
//!    work queue. The queue is drained synchronously: every scheduled node
//!    cancels its in-flight run, gets a fresh token and spawns a new run on
//!    the scheduler.
//! 2. Loading flags are recomputed. A node is loading while its own run is in
//!    flight or queued, or while any helper it reads is loading.
//! 3. The aggregate state is reclassified.
//! 4. Queued events are delivered one at a time, outside any borrow, so
//!    listeners may call back into the graph.
//!
//! Run completions arrive asynchronously and re-enter the loop.
//!
//! ## Aggregate state
//!
//! - `Loading`: a non-static setting is uninitialized or loading, or a stored
//!   data dependency nobody reads from is loading.
//! - `Failed`: otherwise, if a setting is invalid, still holds a rejected
//!   persisted value, or the settings validator says no.
//! - `Loaded`: otherwise.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use strata_config::EngineSettings;
use strata_core::{LoadingState, OverrideSource, SettingKind};

use crate::cancel::CancellationToken;
use crate::category::AvailableValues;
use crate::dependency::{
    boxed_available_values_update, boxed_update, DependencyHandle, DependencyNode, RunOutcome,
    Sink, UpdateContext, UpdateFn, UpdateResult,
};
use crate::error::{EngineError, UpdateError};
use crate::events::{EventBus, GraphEvent, GraphTopic, SettingEvent, SettingTopic, SubscriptionId};
use crate::global::{GlobalContext, GlobalKey};
use crate::layer::LayerDefinition;
use crate::overrides::OverrideProvider;
use crate::registry::SettingRegistry;
use crate::scheduler::Scheduler;
use crate::setting::{Setting, SettingChanges, SettingsSnapshot};

/// Layer-level check run once every setting is individually valid.
pub type SettingsValidator = Rc<dyn Fn(&SettingsSnapshot) -> bool>;

// ============================================================================
// State
// ============================================================================

pub(crate) struct GraphState {
    settings: Vec<Setting>,
    index: FxHashMap<SettingKind, usize>,
    deps: Vec<DependencyNode>,
    setting_watchers: FxHashMap<SettingKind, Vec<DependencyHandle>>,
    stored_data: FxHashMap<String, Value>,
    child_subscriptions: FxHashMap<SubscriptionId, DependencyHandle>,
    loading_state: LoadingState,
    validator: Option<SettingsValidator>,
    work: VecDeque<DependencyHandle>,
    outbox: VecDeque<GraphEvent>,
    /// A setting changed value or persisted state since the last settle.
    settings_changed: bool,
    /// Aggregate state needs reclassification.
    dirty: bool,
    initialized: bool,
    destroyed: bool,
}

impl GraphState {
    fn setting_index(&self, kind: SettingKind) -> Result<usize, EngineError> {
        self.index
            .get(&kind)
            .copied()
            .ok_or(EngineError::SettingNotInGraph(kind))
    }

    fn node(&self, handle: DependencyHandle) -> Option<&DependencyNode> {
        self.deps.get(handle.index())
    }

    fn schedule(&mut self, handle: DependencyHandle) {
        if !self.initialized || self.destroyed {
            return;
        }
        let Some(node) = self.deps.get_mut(handle.index()) else {
            return;
        };
        if node.initialized && !node.pending {
            node.pending = true;
            self.work.push_back(handle);
        }
    }

    fn apply_setting_changes(&mut self, idx: usize, changes: SettingChanges) {
        if changes.is_empty() {
            return;
        }
        if changes.affects_aggregate() {
            self.dirty = true;
        }

        let setting = &self.settings[idx];
        let kind = setting.kind();
        let events = setting.events_for(&changes);
        self.outbox.extend(events.into_iter().map(GraphEvent::Setting));

        if changes.triggers_dependents() {
            self.settings_changed = true;
            let watchers = self.setting_watchers.get(&kind).cloned().unwrap_or_default();
            for handle in watchers {
                self.schedule(handle);
            }
        }
    }

    /// Push an emitted value into its sink and schedule the readers.
    fn deliver(&mut self, handle: DependencyHandle, value: Option<Value>) {
        let Some(node) = self.node(handle) else {
            return;
        };
        let sink = node.sink.clone();
        let children = node.children.clone();

        self.outbox.push_back(GraphEvent::DependencyValueChanged {
            handle,
            value: value.clone(),
        });

        match sink {
            Sink::AvailableValues(kind) => {
                if let Some(&idx) = self.index.get(&kind) {
                    let changes = match value.map(serde_json::from_value::<AvailableValues>) {
                        Some(Ok(available)) => self.settings[idx].set_available_values(available),
                        Some(Err(e)) => {
                            log::warn!("{handle}: cannot decode available values for {kind}: {e}");
                            self.settings[idx].clear_available_values()
                        }
                        None => self.settings[idx].clear_available_values(),
                    };
                    self.apply_setting_changes(idx, changes);
                }
            }
            Sink::StoredData(key) => {
                match value {
                    Some(v) => self.stored_data.insert(key.clone(), v),
                    None => self.stored_data.remove(&key),
                };
                self.dirty = true;
                self.outbox.push_back(GraphEvent::StoredDataChanged { key });
            }
            Sink::Helper => {}
        }

        for child in children {
            self.schedule(child);
        }
    }

    /// Recompute loading for every node and every setting fed by a node.
    fn refresh_loading(&mut self) {
        let mut loading: Vec<bool> = self.deps.iter().map(|n| n.running || n.pending).collect();
        // Fixed point over parent edges; monotone so it terminates
        let mut changed = true;
        while changed {
            changed = false;
            for (i, node) in self.deps.iter().enumerate() {
                if !loading[i] && node.parents.iter().any(|p| loading[p.index()]) {
                    loading[i] = true;
                    changed = true;
                }
            }
        }

        let mut setting_loading = vec![false; self.settings.len()];
        for (i, node) in self.deps.iter_mut().enumerate() {
            if let Sink::AvailableValues(kind) = &node.sink {
                if let Some(&idx) = self.index.get(kind) {
                    setting_loading[idx] |= loading[i];
                }
            }
            if node.loading != loading[i] {
                node.loading = loading[i];
                self.dirty = true;
                self.outbox.push_back(GraphEvent::DependencyLoadingChanged {
                    handle: DependencyHandle(i as u32),
                    loading: loading[i],
                    has_children: node.has_children(),
                });
            }
        }

        for (idx, is_loading) in setting_loading.into_iter().enumerate() {
            let changes = self.settings[idx].set_loading(is_loading);
            self.apply_setting_changes(idx, changes);
        }
    }

    /// Classification without the settings validator.
    fn classify(&self) -> LoadingState {
        let settings_pending = self
            .settings
            .iter()
            .any(|s| !s.is_static() && (!s.is_initialized() || s.is_loading()));
        let stored_data_pending = self.deps.iter().any(|n| {
            matches!(n.sink, Sink::StoredData(_)) && n.loading && !n.has_children()
        });
        if settings_pending || stored_data_pending {
            return LoadingState::Loading;
        }

        if self
            .settings
            .iter()
            .any(|s| !s.is_valid() || s.is_persisted_rejected())
        {
            return LoadingState::Failed;
        }
        LoadingState::Loaded
    }

    fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot::new(
            self.settings
                .iter()
                .map(|s| (s.kind(), s.value().clone()))
                .collect(),
        )
    }
}

// ============================================================================
// Shared core
// ============================================================================

pub(crate) struct GraphShared {
    state: RefCell<GraphState>,
    events: EventBus<GraphEvent>,
    scheduler: Scheduler,
    global: Rc<GlobalContext>,
    config: EngineSettings,
    pumping: Cell<bool>,
    self_ref: Weak<GraphShared>,
}

impl GraphShared {
    fn trace(&self, args: fmt::Arguments<'_>) {
        let level = if self.config.trace_dependency_runs {
            log::Level::Debug
        } else {
            log::Level::Trace
        };
        log::log!(level, "{args}");
    }

    /// Drain work, settle and deliver events until everything is quiet.
    /// Re-entrant calls return immediately; the outer loop picks up their
    /// work.
    fn pump(&self) {
        if self.pumping.replace(true) {
            return;
        }
        loop {
            while let Some(handle) = self.next_work() {
                self.start_run(handle);
            }
            self.settle();

            let next = self.state.borrow_mut().outbox.pop_front();
            match next {
                Some(event) => self.events.emit(&event),
                None => {
                    if self.state.borrow().work.is_empty() {
                        break;
                    }
                }
            }
        }
        self.pumping.set(false);
    }

    fn next_work(&self) -> Option<DependencyHandle> {
        self.state.borrow_mut().work.pop_front()
    }

    fn start_run(&self, handle: DependencyHandle) {
        let (update, token, run) = {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return;
            }
            let Some(node) = state.deps.get_mut(handle.index()) else {
                return;
            };
            if !node.pending {
                return;
            }
            let token = node.begin_run();
            (node.update.clone(), token, node.runs)
        };

        self.trace(format_args!("{handle}: run #{run} started"));
        let fut = update(UpdateContext::new(self.self_ref.clone(), handle, token.clone()));
        let weak = self.self_ref.clone();
        self.scheduler.spawn(async move {
            let result = fut.await;
            if let Some(shared) = weak.upgrade() {
                shared.finish_run(handle, &token, result);
            }
        });
    }

    fn finish_run(&self, handle: DependencyHandle, token: &CancellationToken, result: UpdateResult) {
        {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return;
            }
            let Some(node) = state.deps.get_mut(handle.index()) else {
                return;
            };
            let run = node.runs;
            match node.complete_run(token, result) {
                RunOutcome::Stale => {
                    self.trace(format_args!("{handle}: stale result discarded"));
                    return;
                }
                RunOutcome::Unchanged => {
                    self.trace(format_args!("{handle}: run #{run} finished, value unchanged"));
                    state.dirty = true;
                }
                RunOutcome::Emitted(value) => {
                    self.trace(format_args!("{handle}: run #{run} finished, emitting"));
                    state.deliver(handle, value);
                }
            }
        }
        self.pump();
    }

    fn settle(&self) {
        let (base, check) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            if state.destroyed {
                return;
            }
            state.refresh_loading();
            if state.settings_changed {
                state.settings_changed = false;
                state.outbox.push_back(GraphEvent::SettingsChanged);
            }
            if !state.initialized || !state.dirty {
                return;
            }
            state.dirty = false;

            let base = state.classify();
            let check = match (&state.validator, base) {
                (Some(validator), LoadingState::Loaded) => Some((validator.clone(), state.snapshot())),
                _ => None,
            };
            (base, check)
        };

        let current = match check {
            Some((validator, snapshot)) if !validator(&snapshot) => LoadingState::Failed,
            _ => base,
        };

        let mut state = self.state.borrow_mut();
        let previous = state.loading_state;
        if previous != current {
            state.loading_state = current;
            if self.config.log_state_transitions {
                log::info!("settings state {previous} -> {current}");
            }
            state
                .outbox
                .push_back(GraphEvent::LoadingStateChanged { previous, current });
        }
    }

    /// Poll the update function once with a throwaway token so its reads
    /// register edges, then schedule it if it reads no helper.
    fn discover(&self, handle: DependencyHandle) {
        let update = {
            let state = self.state.borrow();
            match state.node(handle) {
                Some(node) => node.update.clone(),
                None => return,
            }
        };

        let token = CancellationToken::new();
        let mut fut = update(UpdateContext::new(self.self_ref.clone(), handle, token.clone()));
        let _ = smol::future::block_on(smol::future::poll_once(&mut fut));
        token.cancel();
        drop(fut);

        let mut state = self.state.borrow_mut();
        if let Some(node) = state.deps.get_mut(handle.index()) {
            node.initialized = true;
        }
    }

    fn schedule_roots(&self, handles: impl IntoIterator<Item = DependencyHandle>) {
        let mut state = self.state.borrow_mut();
        for handle in handles {
            if state.node(handle).is_some_and(|n| n.parents.is_empty()) {
                state.schedule(handle);
            }
        }
    }

    fn add_dependency(&self, sink: Sink, update: UpdateFn) -> DependencyHandle {
        let (handle, initialized) = {
            let mut state = self.state.borrow_mut();
            let handle = DependencyHandle(state.deps.len() as u32);
            log::debug!("{handle}: created for {sink:?}");
            state.deps.push(DependencyNode::new(sink, update));
            (handle, state.initialized)
        };

        // Late nodes run once right away; helpers they read may have
        // emitted already.
        if initialized {
            self.discover(handle);
            self.state.borrow_mut().schedule(handle);
            self.pump();
        }
        handle
    }

    // ------------------------------------------------------------------
    // Reads from update functions
    // ------------------------------------------------------------------

    pub(crate) fn read_local_setting(&self, handle: DependencyHandle, kind: SettingKind) -> Value {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(&idx) = state.index.get(&kind) else {
            log::error!("{handle}: read setting {kind} which is not part of this graph");
            return Value::Null;
        };

        let watchers = state.setting_watchers.entry(kind).or_default();
        if !watchers.contains(&handle) {
            watchers.push(handle);
        }
        if let Some(node) = state.deps.get_mut(handle.index()) {
            if !node.watched_settings.contains(&kind) {
                node.watched_settings.push(kind);
            }
        }
        state.settings[idx].value().clone()
    }

    pub(crate) fn read_global(&self, handle: DependencyHandle, key: GlobalKey) -> Value {
        let value = self.global.get(key);
        if let Some(node) = self.state.borrow_mut().deps.get_mut(handle.index()) {
            node.watched_globals.insert(key, value.clone());
        }
        value
    }

    pub(crate) fn read_helper(
        &self,
        handle: DependencyHandle,
        helper: DependencyHandle,
    ) -> Option<Value> {
        let mut state = self.state.borrow_mut();
        if helper == handle || helper.index() >= state.deps.len() || handle.index() >= state.deps.len() {
            log::error!("{handle}: invalid helper dependency {helper}");
            return None;
        }

        let parent = &mut state.deps[helper.index()];
        if !parent.children.contains(&handle) {
            parent.children.push(handle);
        }
        let value = parent.value.clone();

        let child = &mut state.deps[handle.index()];
        if !child.parents.contains(&helper) {
            child.parents.push(helper);
        }
        value
    }

    fn on_global_changed(&self, key: GlobalKey, value: &Value) {
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let mut targets = Vec::new();
            for (i, node) in state.deps.iter_mut().enumerate() {
                if let Some(cached) = node.watched_globals.get_mut(&key) {
                    if cached != value {
                        *cached = value.clone();
                        targets.push(DependencyHandle(i as u32));
                    }
                }
            }
            for handle in targets {
                state.schedule(handle);
            }
        }
        self.pump();
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Settings and dependencies of one layer or group.
///
/// Dropping the graph cancels every in-flight run, releases its global
/// context subscription and drops all listeners.
pub struct SettingsGraph {
    shared: Rc<GraphShared>,
    global_subscription: SubscriptionId,
}

impl SettingsGraph {
    /// Create a graph holding one setting per kind, in the given order.
    ///
    /// # Errors
    ///
    /// `UnknownSetting` if a kind is not registered,
    /// `DuplicateSettingInGraph` if a kind is listed twice.
    pub fn new(
        registry: &SettingRegistry,
        kinds: &[SettingKind],
        global: Rc<GlobalContext>,
        scheduler: Scheduler,
        config: EngineSettings,
    ) -> Result<Self, EngineError> {
        let mut settings = Vec::with_capacity(kinds.len());
        let mut index = FxHashMap::default();
        for &kind in kinds {
            if index.insert(kind, settings.len()).is_some() {
                return Err(EngineError::DuplicateSettingInGraph(kind));
            }
            settings.push(registry.create_setting(kind)?);
        }
        log::debug!("settings graph created with {} settings", settings.len());

        let state = GraphState {
            settings,
            index,
            deps: Vec::new(),
            setting_watchers: FxHashMap::default(),
            stored_data: FxHashMap::default(),
            child_subscriptions: FxHashMap::default(),
            loading_state: LoadingState::Loading,
            validator: None,
            work: VecDeque::new(),
            outbox: VecDeque::new(),
            settings_changed: false,
            dirty: true,
            initialized: false,
            destroyed: false,
        };

        let shared = Rc::new_cyclic(|weak| GraphShared {
            state: RefCell::new(state),
            events: EventBus::new(),
            scheduler,
            global,
            config,
            pumping: Cell::new(false),
            self_ref: weak.clone(),
        });

        let weak = Rc::downgrade(&shared);
        let global_subscription = shared.global.subscribe(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_global_changed(event.key, &event.value);
            }
        });

        Ok(Self {
            shared,
            global_subscription,
        })
    }

    /// Build, wire and initialize the graph for a layer definition.
    pub fn from_layer(
        layer: Rc<dyn LayerDefinition>,
        registry: &SettingRegistry,
        global: Rc<GlobalContext>,
        scheduler: Scheduler,
        config: EngineSettings,
    ) -> Result<Self, EngineError> {
        let graph = Self::new(registry, &layer.settings(), global, scheduler, config)?;
        layer.define_dependencies(&graph)?;

        let validator = layer.clone();
        graph.set_settings_validator(move |snapshot| validator.are_current_settings_valid(snapshot));
        graph.initialize();
        Ok(graph)
    }

    // ========================================================================
    // Wiring
    // ========================================================================

    /// Compute the available values of `kind`. An absent result empties them
    /// without initializing the setting.
    pub fn available_settings_updater<F, Fut>(
        &self,
        kind: SettingKind,
        update: F,
    ) -> Result<DependencyHandle, EngineError>
    where
        F: Fn(UpdateContext) -> Fut + 'static,
        Fut: Future<Output = Result<Option<AvailableValues>, UpdateError>> + 'static,
    {
        {
            let state = self.shared.state.borrow();
            let idx = state.setting_index(kind)?;
            if state.settings[idx].is_static() {
                return Err(EngineError::StaticSettingHasNoUpdater(kind));
            }
        }
        Ok(self
            .shared
            .add_dependency(Sink::AvailableValues(kind), boxed_available_values_update(update)))
    }

    /// Compute a graph-level value stored under `key`.
    pub fn stored_data_updater<F, Fut>(&self, key: impl Into<String>, update: F) -> DependencyHandle
    where
        F: Fn(UpdateContext) -> Fut + 'static,
        Fut: Future<Output = UpdateResult> + 'static,
    {
        self.shared
            .add_dependency(Sink::StoredData(key.into()), boxed_update(update))
    }

    /// Compute an intermediate value other dependencies can read with
    /// `UpdateContext::get_helper_dependency`.
    pub fn helper_dependency<F, Fut>(&self, update: F) -> DependencyHandle
    where
        F: Fn(UpdateContext) -> Fut + 'static,
        Fut: Future<Output = UpdateResult> + 'static,
    {
        self.shared.add_dependency(Sink::Helper, boxed_update(update))
    }

    pub fn set_settings_validator(&self, validator: impl Fn(&SettingsSnapshot) -> bool + 'static) {
        {
            let mut state = self.shared.state.borrow_mut();
            state.validator = Some(Rc::new(validator));
            state.dirty = true;
        }
        self.shared.pump();
    }

    /// Discover every dependency's reads and start the ones that read no
    /// helper. Calling it twice is a no-op.
    pub fn initialize(&self) {
        let count = {
            let state = self.shared.state.borrow();
            if state.initialized || state.destroyed {
                return;
            }
            state.deps.len()
        };

        let handles: Vec<_> = (0..count).map(|i| DependencyHandle(i as u32)).collect();
        for &handle in &handles {
            self.shared.discover(handle);
        }
        {
            let mut state = self.shared.state.borrow_mut();
            state.initialized = true;
            state.dirty = true;
        }
        self.shared.schedule_roots(handles);
        self.shared.pump();
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state.borrow().initialized
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// User edit of a setting's own value.
    pub fn set_value(&self, kind: SettingKind, value: Value) -> Result<(), EngineError> {
        {
            let mut state = self.shared.state.borrow_mut();
            let idx = state.setting_index(kind)?;
            let changes = state.settings[idx].set_value(value);
            state.apply_setting_changes(idx, changes);
        }
        self.shared.pump();
        Ok(())
    }

    /// Effective value.
    pub fn value(&self, kind: SettingKind) -> Result<Value, EngineError> {
        let state = self.shared.state.borrow();
        let idx = state.setting_index(kind)?;
        Ok(state.settings[idx].value().clone())
    }

    pub fn value_as<T: DeserializeOwned>(&self, kind: SettingKind) -> Result<Option<T>, EngineError> {
        Ok(serde_json::from_value(self.value(kind)?).ok())
    }

    /// Copy of a setting's current state.
    pub fn setting(&self, kind: SettingKind) -> Result<Setting, EngineError> {
        let state = self.shared.state.borrow();
        let idx = state.setting_index(kind)?;
        Ok(state.settings[idx].clone())
    }

    pub fn settings(&self) -> Vec<Setting> {
        self.shared.state.borrow().settings.clone()
    }

    pub fn kinds(&self) -> Vec<SettingKind> {
        self.shared
            .state
            .borrow()
            .settings
            .iter()
            .map(|s| s.kind())
            .collect()
    }

    pub fn contains(&self, kind: SettingKind) -> bool {
        self.shared.state.borrow().index.contains_key(&kind)
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        self.shared.state.borrow().snapshot()
    }

    pub fn available_values(&self, kind: SettingKind) -> Result<AvailableValues, EngineError> {
        let state = self.shared.state.borrow();
        let idx = state.setting_index(kind)?;
        Ok(state.settings[idx].available_values().clone())
    }

    pub fn is_valid(&self, kind: SettingKind) -> Result<bool, EngineError> {
        let state = self.shared.state.borrow();
        let idx = state.setting_index(kind)?;
        Ok(state.settings[idx].is_valid())
    }

    /// Labels of settings that are invalid or hold a rejected persisted
    /// value, in graph order.
    pub fn invalid_settings(&self) -> Vec<String> {
        self.shared
            .state
            .borrow()
            .settings
            .iter()
            .filter(|s| !s.is_valid() || s.is_persisted_rejected())
            .map(|s| s.label().to_string())
            .collect()
    }

    pub fn loading_state(&self) -> LoadingState {
        self.shared.state.borrow().loading_state
    }

    pub fn stored_data(&self, key: &str) -> Option<Value> {
        self.shared.state.borrow().stored_data.get(key).cloned()
    }

    pub fn stored_data_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.stored_data(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn serialize_value(&self, kind: SettingKind) -> Result<String, EngineError> {
        let state = self.shared.state.borrow();
        let idx = state.setting_index(kind)?;
        Ok(state.settings[idx].serialize_value())
    }

    /// Restore a persisted value. It is held provisionally until checked
    /// against computed available values.
    pub fn deserialize_value(&self, kind: SettingKind, encoded: &str) -> Result<(), EngineError> {
        let result = {
            let mut state = self.shared.state.borrow_mut();
            let idx = state.setting_index(kind)?;
            state.settings[idx]
                .deserialize_value(encoded)
                .map(|changes| state.apply_setting_changes(idx, changes))
        };
        self.shared.pump();
        result
    }

    /// Encoded effective values keyed by kind identifier.
    pub fn serialize_state(&self) -> BTreeMap<String, String> {
        self.shared
            .state
            .borrow()
            .settings
            .iter()
            .map(|s| (s.kind().as_str().to_string(), s.serialize_value()))
            .collect()
    }

    /// Restore values written by `serialize_state`.
    ///
    /// Unknown identifiers and kinds this graph does not hold are skipped.
    /// Every decodable entry is applied; the first decode error is returned.
    /// Does nothing when `persistence.restoreValues` is off.
    pub fn deserialize_state(&self, entries: &BTreeMap<String, String>) -> Result<(), EngineError> {
        if !self.shared.config.restore_persisted_values {
            log::info!("restoring persisted values is disabled; ignoring {} entries", entries.len());
            return Ok(());
        }

        let mut first_error = None;
        {
            let mut state = self.shared.state.borrow_mut();
            for (key, encoded) in entries {
                let kind = match key.parse::<SettingKind>() {
                    Ok(kind) => kind,
                    Err(e) => {
                        log::warn!("{e}; skipping persisted entry");
                        continue;
                    }
                };
                let Ok(idx) = state.setting_index(kind) else {
                    log::debug!("{kind} is not part of this graph; skipping persisted entry");
                    continue;
                };
                match state.settings[idx].deserialize_value(encoded) {
                    Ok(changes) => state.apply_setting_changes(idx, changes),
                    Err(e) => {
                        log::warn!("{e}");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        self.shared.pump();
        first_error.map_or(Ok(()), Err)
    }

    // ========================================================================
    // Overrides
    // ========================================================================

    /// Apply overrides from `providers`, nearest first. A setting with no
    /// provider supplying its kind has its override cleared.
    pub fn check_for_overrides(&self, providers: &[&dyn OverrideProvider]) {
        let resolved: Vec<(Option<Value>, OverrideSource)> = self
            .kinds()
            .into_iter()
            .map(|kind| {
                providers
                    .iter()
                    .find_map(|p| p.overridden_value(kind).map(|v| (Some(v), p.source())))
                    .unwrap_or((None, OverrideSource::None))
            })
            .collect();

        {
            let mut state = self.shared.state.borrow_mut();
            for (idx, (value, source)) in resolved.into_iter().enumerate() {
                let changes = state.settings[idx].set_override(value, source);
                state.apply_setting_changes(idx, changes);
            }
        }
        self.shared.pump();
    }

    // ========================================================================
    // Dependencies
    // ========================================================================

    /// Last emitted value, `None` if absent or never run.
    pub fn dependency_value(&self, handle: DependencyHandle) -> Option<Value> {
        self.shared
            .state
            .borrow()
            .node(handle)
            .and_then(|n| n.value.clone())
    }

    pub fn is_dependency_loading(&self, handle: DependencyHandle) -> bool {
        self.shared
            .state
            .borrow()
            .node(handle)
            .is_some_and(|n| n.loading)
    }

    pub fn dependency_count(&self) -> usize {
        self.shared.state.borrow().deps.len()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(&self, callback: impl Fn(&GraphEvent) + 'static) -> SubscriptionId {
        self.shared.events.subscribe(callback)
    }

    pub fn subscribe_topic(
        &self,
        topic: GraphTopic,
        callback: impl Fn(&GraphEvent) + 'static,
    ) -> SubscriptionId {
        self.shared.events.subscribe_topic(topic, callback)
    }

    /// Events of one topic for one setting.
    pub fn subscribe_setting(
        &self,
        kind: SettingKind,
        topic: SettingTopic,
        callback: impl Fn(&SettingEvent) + 'static,
    ) -> SubscriptionId {
        self.shared
            .events
            .subscribe_topic(GraphTopic::Setting(topic), move |event| {
                if let GraphEvent::Setting(e) = event {
                    if e.kind() == kind {
                        callback(e);
                    }
                }
            })
    }

    /// Values emitted by one dependency. A child subscription counts as a
    /// reader, so a stored-data dependency with one no longer holds the
    /// aggregate in `Loading`.
    pub fn subscribe_dependency(
        &self,
        handle: DependencyHandle,
        is_child_dependency: bool,
        callback: impl Fn(Option<&Value>) + 'static,
    ) -> SubscriptionId {
        let id = self
            .shared
            .events
            .subscribe_topic(GraphTopic::DependencyValueChanged, move |event| {
                if let GraphEvent::DependencyValueChanged { handle: h, value } = event {
                    if *h == handle {
                        callback(value.as_ref());
                    }
                }
            });

        if is_child_dependency {
            {
                let mut guard = self.shared.state.borrow_mut();
                let state = &mut *guard;
                if let Some(node) = state.deps.get_mut(handle.index()) {
                    node.child_subscribers += 1;
                    state.child_subscriptions.insert(id, handle);
                    state.dirty = true;
                }
            }
            self.shared.pump();
        }
        id
    }

    /// Loading transitions of one dependency as `(loading, has_children)`.
    pub fn subscribe_dependency_loading(
        &self,
        handle: DependencyHandle,
        callback: impl Fn(bool, bool) + 'static,
    ) -> SubscriptionId {
        self.shared
            .events
            .subscribe_topic(GraphTopic::DependencyLoadingChanged, move |event| {
                if let GraphEvent::DependencyLoadingChanged {
                    handle: h,
                    loading,
                    has_children,
                } = event
                {
                    if *h == handle {
                        callback(*loading, *has_children);
                    }
                }
            })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.shared.events.unsubscribe(id);
        let released_child = {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            match state.child_subscriptions.remove(&id) {
                Some(handle) => {
                    if let Some(node) = state.deps.get_mut(handle.index()) {
                        node.child_subscribers = node.child_subscribers.saturating_sub(1);
                    }
                    state.dirty = true;
                    true
                }
                None => false,
            }
        };
        if released_child {
            self.shared.pump();
        }
        removed
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn global_context(&self) -> &Rc<GlobalContext> {
        &self.shared.global
    }
}

impl Drop for SettingsGraph {
    fn drop(&mut self) {
        self.shared.global.unsubscribe(self.global_subscription);
        if let Ok(mut state) = self.shared.state.try_borrow_mut() {
            state.destroyed = true;
            for node in state.deps.iter_mut() {
                node.cancel();
            }
            state.work.clear();
            state.outbox.clear();
        }
        self.shared.events.clear();
        log::debug!("settings graph dropped");
    }
}

impl fmt::Debug for SettingsGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("SettingsGraph")
            .field("settings", &state.settings.len())
            .field("dependencies", &state.deps.len())
            .field("loading_state", &state.loading_state)
            .finish()
    }
}
