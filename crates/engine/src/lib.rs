pub mod cancel;
pub mod category;
pub mod dependency;
pub mod error;
pub mod events;
pub mod global;
pub mod graph;
pub mod layer;
pub mod overrides;
pub mod registry;
pub mod scheduler;
pub mod setting;
pub mod updaters;

#[cfg(test)]
pub mod harness;

pub use cancel::CancellationToken;
pub use category::{AvailableValues, Category, NumericBounds};
pub use dependency::{DependencyHandle, UpdateContext, UpdateResult};
pub use error::{EngineError, UpdateError};
pub use events::{EventCollector, GraphEvent, GraphTopic, SettingEvent, SettingTopic, SubscriptionId};
pub use global::{GlobalContext, GlobalKey};
pub use graph::SettingsGraph;
pub use layer::LayerDefinition;
pub use overrides::{GroupOverrides, OverrideProvider, SharedSetting};
pub use registry::{SettingDefinition, SettingRegistry, ValueCodec};
pub use scheduler::Scheduler;
pub use setting::{Setting, SettingChanges, SettingsSnapshot};
