//! Infrastructure layer: queue engines and environment configuration.

pub mod config;
pub mod engine;

pub use config::{ConfigError, EngineConfig, EngineKind};
pub use engine::InMemoryEngine;
#[cfg(feature = "redis")]
pub use engine::RedisEngine;
