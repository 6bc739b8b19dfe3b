//! Dependency nodes and the accessor context handed to update functions.
//!
//! A dependency wraps an asynchronous update function. Every read it performs
//! through its `UpdateContext` (local setting, global field, helper
//! dependency) registers an edge as a side effect, so the graph learns the
//! dependency structure by running the functions, not from declarations.
//!
//! # Invariants
//!
//! - At most one run is in flight per node. Starting a run cancels the
//!   previous token first.
//! - A completion is accepted only if its token is still the node's current
//!   token. Everything else is dropped silently.
//! - An emitted value propagates only if it differs (deep equality) from the
//!   cached value, or if it is absent. Absence always propagates.
//! - Helper dependencies are always created before the nodes that read them,
//!   so parents have lower handles than their children.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use strata_core::SettingKind;

use crate::cancel::CancellationToken;
use crate::category::AvailableValues;
use crate::error::UpdateError;
use crate::global::GlobalKey;
use crate::graph::GraphShared;

/// Index of a dependency in its graph's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyHandle(pub(crate) u32);

impl DependencyHandle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DependencyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dep#{}", self.0)
    }
}

/// `Ok(None)` is the absent value: the dependency computed nothing.
pub type UpdateResult = Result<Option<Value>, UpdateError>;
pub type UpdateFuture = Pin<Box<dyn Future<Output = UpdateResult>>>;
pub(crate) type UpdateFn = Rc<dyn Fn(UpdateContext) -> UpdateFuture>;

pub(crate) fn boxed_update<F, Fut>(f: F) -> UpdateFn
where
    F: Fn(UpdateContext) -> Fut + 'static,
    Fut: Future<Output = UpdateResult> + 'static,
{
    Rc::new(move |ctx| Box::pin(f(ctx)) as UpdateFuture)
}

/// Like `boxed_update`, for functions producing available values.
pub(crate) fn boxed_available_values_update<F, Fut>(f: F) -> UpdateFn
where
    F: Fn(UpdateContext) -> Fut + 'static,
    Fut: Future<Output = Result<Option<AvailableValues>, UpdateError>> + 'static,
{
    Rc::new(move |ctx| {
        let fut = f(ctx);
        Box::pin(async move {
            match fut.await? {
                Some(available) => Ok(Some(serde_json::to_value(available)?)),
                None => Ok(None),
            }
        }) as UpdateFuture
    })
}

/// Where a dependency's emissions go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sink {
    /// Available values of a setting.
    AvailableValues(SettingKind),
    /// Graph-level stored data under a key.
    StoredData(String),
    /// Only other dependencies and subscribers read it.
    Helper,
}

/// Outcome of a completed run after staleness and equality checks.
#[derive(Debug, PartialEq)]
pub(crate) enum RunOutcome {
    /// Token was superseded; nothing happens.
    Stale,
    /// Same value as the cache; dependents are not notified.
    Unchanged,
    /// New value (or absence) to propagate.
    Emitted(Option<Value>),
}

pub(crate) struct DependencyNode {
    pub sink: Sink,
    pub update: UpdateFn,
    pub value: Option<Value>,
    pub token: Option<CancellationToken>,
    pub running: bool,
    pub pending: bool,
    /// Last published loading state.
    pub loading: bool,
    /// Helper dependencies this node reads.
    pub parents: Vec<DependencyHandle>,
    /// Dependencies that read this node.
    pub children: Vec<DependencyHandle>,
    /// External subscribers registered as child dependencies.
    pub child_subscribers: usize,
    pub watched_settings: Vec<SettingKind>,
    /// Last observed copy of each global field read.
    pub watched_globals: FxHashMap<GlobalKey, Value>,
    pub initialized: bool,
    pub runs: u64,
}

impl DependencyNode {
    pub fn new(sink: Sink, update: UpdateFn) -> Self {
        Self {
            sink,
            update,
            value: None,
            token: None,
            running: false,
            pending: false,
            loading: false,
            parents: Vec::new(),
            children: Vec::new(),
            child_subscribers: 0,
            watched_settings: Vec::new(),
            watched_globals: FxHashMap::default(),
            initialized: false,
            runs: 0,
        }
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty() || self.child_subscribers > 0
    }

    /// Cancel the in-flight run, if any, and issue a fresh token.
    pub fn begin_run(&mut self) -> CancellationToken {
        if let Some(previous) = self.token.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        self.token = Some(token.clone());
        self.running = true;
        self.pending = false;
        self.runs += 1;
        token
    }

    /// Accept or discard the result of the run that owned `token`.
    pub fn complete_run(&mut self, token: &CancellationToken, result: UpdateResult) -> RunOutcome {
        let current = self.token.as_ref().is_some_and(|t| t.same_as(token));
        if !current {
            return RunOutcome::Stale;
        }
        self.token = None;
        self.running = false;

        let value = match result {
            Ok(value) => value,
            Err(UpdateError::Cancelled) => return RunOutcome::Unchanged,
            Err(UpdateError::Failed(message)) => {
                log::warn!("{:?} update failed: {message}", self.sink);
                None
            }
        };

        if value.is_some() && value == self.value {
            return RunOutcome::Unchanged;
        }
        self.value = value.clone();
        RunOutcome::Emitted(value)
    }

    /// Drop the in-flight run without replacing it.
    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.running = false;
        self.pending = false;
    }
}

// ============================================================================
// Update context
// ============================================================================

/// Accessors for one run of an update function.
///
/// Reads register the calling dependency as a dependent of what it read.
/// Once the owning graph is dropped every read returns the empty value.
#[derive(Clone)]
pub struct UpdateContext {
    shared: Weak<GraphShared>,
    handle: DependencyHandle,
    token: CancellationToken,
}

impl UpdateContext {
    pub(crate) fn new(
        shared: Weak<GraphShared>,
        handle: DependencyHandle,
        token: CancellationToken,
    ) -> Self {
        Self {
            shared,
            handle,
            token,
        }
    }

    /// Handle of the dependency this run belongs to.
    pub fn handle(&self) -> DependencyHandle {
        self.handle
    }

    /// Effective value of a setting in the same graph. Re-runs this
    /// dependency when that value (or its persisted state) changes.
    pub fn get_local_setting(&self, kind: SettingKind) -> Value {
        match self.shared.upgrade() {
            Some(shared) => shared.read_local_setting(self.handle, kind),
            None => Value::Null,
        }
    }

    pub fn get_local_setting_as<T: DeserializeOwned>(&self, kind: SettingKind) -> Option<T> {
        serde_json::from_value(self.get_local_setting(kind)).ok()
    }

    /// Value of a global field. Re-runs this dependency when the field
    /// changes to something not deep-equal to what was read.
    pub fn get_global_setting(&self, key: GlobalKey) -> Value {
        match self.shared.upgrade() {
            Some(shared) => shared.read_global(self.handle, key),
            None => Value::Null,
        }
    }

    pub fn get_global_setting_as<T: DeserializeOwned>(&self, key: GlobalKey) -> Option<T> {
        serde_json::from_value(self.get_global_setting(key)).ok()
    }

    /// Last value emitted by a helper dependency. Re-runs this dependency
    /// whenever the helper emits.
    pub fn get_helper_dependency(&self, helper: DependencyHandle) -> Option<Value> {
        self.shared
            .upgrade()
            .and_then(|shared| shared.read_helper(self.handle, helper))
    }

    pub fn get_helper_dependency_as<T: DeserializeOwned>(&self, helper: DependencyHandle) -> Option<T> {
        self.get_helper_dependency(helper)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(UpdateError::Cancelled)` once superseded.
    pub fn check(&self) -> Result<(), UpdateError> {
        self.token.check()
    }
}

impl fmt::Debug for UpdateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateContext")
            .field("handle", &self.handle)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
