//! Event types and the event bus used by settings graphs.
//!
//! Every notification the engine produces is a variant of a closed event enum.
//! Subscribers register on an `EventBus` (optionally filtered by topic) and
//! get a `SubscriptionId` back, which releases the registration when passed to
//! `unsubscribe`. Graphs release their own registrations on drop.
//!
//! `EventCollector` records events for tests and diagnostics.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use strata_core::{LoadingState, OverrideSource, SettingKind};

use crate::dependency::DependencyHandle;

/// Registration handle returned by `EventBus::subscribe*`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// An event with a topic that subscribers can filter on.
pub trait Event: Clone + 'static {
    type Topic: Copy + Eq + fmt::Debug + 'static;

    fn topic(&self) -> Self::Topic;
}

// ============================================================================
// Setting events
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SettingTopic {
    ValueAboutToBeChanged,
    ValueChanged,
    ValidityChanged,
    AvailableValuesChanged,
    OverriddenValueChanged,
    OverrideSourceChanged,
    LoadingChanged,
    InitializedChanged,
    PersistedChanged,
}

/// Per-setting notifications. Payloads carry the new state.
#[derive(Clone, Debug, PartialEq)]
pub enum SettingEvent {
    ValueAboutToBeChanged { kind: SettingKind },
    /// Effective value after the change.
    ValueChanged { kind: SettingKind, value: Value },
    ValidityChanged { kind: SettingKind, is_valid: bool },
    AvailableValuesChanged { kind: SettingKind },
    OverriddenValueChanged { kind: SettingKind, value: Option<Value> },
    OverrideSourceChanged { kind: SettingKind, source: OverrideSource },
    LoadingChanged { kind: SettingKind, loading: bool },
    InitializedChanged { kind: SettingKind },
    PersistedChanged { kind: SettingKind, persisted: bool },
}

impl SettingEvent {
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingEvent::ValueAboutToBeChanged { kind }
            | SettingEvent::ValueChanged { kind, .. }
            | SettingEvent::ValidityChanged { kind, .. }
            | SettingEvent::AvailableValuesChanged { kind }
            | SettingEvent::OverriddenValueChanged { kind, .. }
            | SettingEvent::OverrideSourceChanged { kind, .. }
            | SettingEvent::LoadingChanged { kind, .. }
            | SettingEvent::InitializedChanged { kind }
            | SettingEvent::PersistedChanged { kind, .. } => *kind,
        }
    }
}

impl Event for SettingEvent {
    type Topic = SettingTopic;

    fn topic(&self) -> SettingTopic {
        match self {
            SettingEvent::ValueAboutToBeChanged { .. } => SettingTopic::ValueAboutToBeChanged,
            SettingEvent::ValueChanged { .. } => SettingTopic::ValueChanged,
            SettingEvent::ValidityChanged { .. } => SettingTopic::ValidityChanged,
            SettingEvent::AvailableValuesChanged { .. } => SettingTopic::AvailableValuesChanged,
            SettingEvent::OverriddenValueChanged { .. } => SettingTopic::OverriddenValueChanged,
            SettingEvent::OverrideSourceChanged { .. } => SettingTopic::OverrideSourceChanged,
            SettingEvent::LoadingChanged { .. } => SettingTopic::LoadingChanged,
            SettingEvent::InitializedChanged { .. } => SettingTopic::InitializedChanged,
            SettingEvent::PersistedChanged { .. } => SettingTopic::PersistedChanged,
        }
    }
}

// ============================================================================
// Graph events
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GraphTopic {
    Setting(SettingTopic),
    SettingsChanged,
    StoredDataChanged,
    LoadingStateChanged,
    DependencyValueChanged,
    DependencyLoadingChanged,
}

/// Events emitted by a `SettingsGraph`.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphEvent {
    Setting(SettingEvent),

    /// One or more settings changed value or persisted state.
    /// Coalesced: emitted at most once per settled turn.
    SettingsChanged,

    StoredDataChanged { key: String },

    /// Aggregate state transition. Never emitted with `previous == current`.
    LoadingStateChanged {
        previous: LoadingState,
        current: LoadingState,
    },

    /// A dependency emitted. `None` is the absent value.
    DependencyValueChanged {
        handle: DependencyHandle,
        value: Option<Value>,
    },

    DependencyLoadingChanged {
        handle: DependencyHandle,
        loading: bool,
        has_children: bool,
    },
}

impl Event for GraphEvent {
    type Topic = GraphTopic;

    fn topic(&self) -> GraphTopic {
        match self {
            GraphEvent::Setting(e) => GraphTopic::Setting(e.topic()),
            GraphEvent::SettingsChanged => GraphTopic::SettingsChanged,
            GraphEvent::StoredDataChanged { .. } => GraphTopic::StoredDataChanged,
            GraphEvent::LoadingStateChanged { .. } => GraphTopic::LoadingStateChanged,
            GraphEvent::DependencyValueChanged { .. } => GraphTopic::DependencyValueChanged,
            GraphEvent::DependencyLoadingChanged { .. } => GraphTopic::DependencyLoadingChanged,
        }
    }
}

// ============================================================================
// Event bus
// ============================================================================

/// Callback type for receiving events.
pub type EventCallback<E> = Rc<dyn Fn(&E)>;

struct Listener<E: Event> {
    id: SubscriptionId,
    topic: Option<E::Topic>,
    callback: EventCallback<E>,
}

/// Single-threaded publish/subscribe channel.
///
/// Listeners run synchronously in registration order. A listener may
/// subscribe or unsubscribe during `emit`; listeners removed mid-emit are not
/// called afterwards.
pub struct EventBus<E: Event> {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<Listener<E>>>,
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            next_id: Cell::new(1),
            listeners: RefCell::new(Vec::new()),
        }
    }
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn subscribe(&self, callback: impl Fn(&E) + 'static) -> SubscriptionId {
        self.register(None, Rc::new(callback))
    }

    /// Receive only events of one topic.
    pub fn subscribe_topic(
        &self,
        topic: E::Topic,
        callback: impl Fn(&E) + 'static,
    ) -> SubscriptionId {
        self.register(Some(topic), Rc::new(callback))
    }

    fn register(&self, topic: Option<E::Topic>, callback: EventCallback<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push(Listener {
            id,
            topic,
            callback,
        });
        id
    }

    /// Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: &E) {
        let topic = event.topic();
        let targets: Vec<(SubscriptionId, EventCallback<E>)> = self
            .listeners
            .borrow()
            .iter()
            .filter(|l| l.topic.map_or(true, |t| t == topic))
            .map(|l| (l.id, l.callback.clone()))
            .collect();

        for (id, callback) in targets {
            if self.is_subscribed(id) {
                callback(event);
            }
        }
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.listeners.borrow().iter().any(|l| l.id == id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn clear(&self) {
        self.listeners.borrow_mut().clear();
    }
}

// ============================================================================
// Collector
// ============================================================================

/// Records every event emitted on a bus.
pub struct EventCollector<E: Event> {
    events: Rc<RefCell<Vec<E>>>,
}

impl<E: Event> Default for EventCollector<E> {
    fn default() -> Self {
        Self {
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<E: Event> EventCollector<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `bus`. The returned id detaches the collector.
    pub fn attach(&self, bus: &EventBus<E>) -> SubscriptionId {
        let events = self.events.clone();
        bus.subscribe(move |e| events.borrow_mut().push(e.clone()))
    }

    /// A callback that records into this collector.
    pub fn sink(&self) -> impl Fn(&E) + 'static {
        let events = self.events.clone();
        move |e: &E| events.borrow_mut().push(e.clone())
    }

    pub fn events(&self) -> Vec<E> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn count_topic(&self, topic: E::Topic) -> usize {
        self.events.borrow().iter().filter(|e| e.topic() == topic).count()
    }
}

impl EventCollector<GraphEvent> {
    /// All aggregate transitions, in order.
    pub fn loading_transitions(&self) -> Vec<(LoadingState, LoadingState)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                GraphEvent::LoadingStateChanged { previous, current } => Some((*previous, *current)),
                _ => None,
            })
            .collect()
    }

    /// Effective values announced for one setting, in order.
    pub fn value_changes(&self, kind: SettingKind) -> Vec<Value> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                GraphEvent::Setting(SettingEvent::ValueChanged { kind: k, value }) if *k == kind => {
                    Some(value.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Values emitted by one dependency, in order.
    pub fn dependency_values(&self, handle: DependencyHandle) -> Vec<Option<Value>> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                GraphEvent::DependencyValueChanged { handle: h, value } if *h == handle => {
                    Some(value.clone())
                }
                _ => None,
            })
            .collect()
    }
}
