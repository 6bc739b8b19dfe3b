// Configuration loading

pub mod engine;
pub mod error;

pub use engine::EngineSettings;
pub use error::ConfigError;
