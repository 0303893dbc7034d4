//! Environment-driven engine configuration.
//!
//! | Variable                    | Default                  |
//! |-----------------------------|--------------------------|
//! | `JOBKEEPER_ENGINE`          | `memory` (or `redis`)    |
//! | `REDIS_URL`                 | `redis://localhost:6379` |
//! | `JOBKEEPER_KEY_PREFIX`      | `jobkeeper`              |
//! | `JOBKEEPER_RESULT_TTL_SECS` | `1800`                   |

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use jobkeeper_engine::SharedEngine;

use crate::engine::InMemoryEngine;

pub const ENGINE_VAR: &str = "JOBKEEPER_ENGINE";
pub const REDIS_URL_VAR: &str = "REDIS_URL";
pub const KEY_PREFIX_VAR: &str = "JOBKEEPER_KEY_PREFIX";
pub const RESULT_TTL_VAR: &str = "JOBKEEPER_RESULT_TTL_SECS";

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_KEY_PREFIX: &str = "jobkeeper";
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown engine kind: {0} (expected `memory` or `redis`)")]
    UnknownEngine(String),

    #[error("failed to build engine: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Memory,
    Redis,
}

impl std::str::FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "memory" | "in-memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::UnknownEngine(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub redis_url: String,
    pub key_prefix: String,
    /// How long completed jobs are kept when a TTL companion is scheduled.
    pub result_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Memory,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            result_ttl: DEFAULT_RESULT_TTL,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let kind = match lookup(ENGINE_VAR) {
            Some(raw) => raw.parse()?,
            None => defaults.kind,
        };

        let result_ttl = match lookup(RESULT_TTL_VAR) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    warn!(var = RESULT_TTL_VAR, value = %raw, "invalid number, using default");
                    defaults.result_ttl
                }
            },
            None => defaults.result_ttl,
        };

        Ok(Self {
            kind,
            redis_url: lookup(REDIS_URL_VAR).unwrap_or(defaults.redis_url),
            key_prefix: lookup(KEY_PREFIX_VAR).unwrap_or(defaults.key_prefix),
            result_ttl,
        })
    }

    /// Construct the configured engine.
    pub fn build_engine(&self) -> Result<SharedEngine, ConfigError> {
        match self.kind {
            EngineKind::Memory => {
                info!("using in-memory queue engine");
                Ok(Arc::new(InMemoryEngine::new()))
            }
            EngineKind::Redis => self.build_redis(),
        }
    }

    #[cfg(feature = "redis")]
    fn build_redis(&self) -> Result<SharedEngine, ConfigError> {
        let engine = crate::engine::RedisEngine::new(&self.redis_url, Some(self.key_prefix.clone()))
            .map_err(|e| ConfigError::Engine(e.to_string()))?;
        info!(prefix = %self.key_prefix, "using redis queue engine");
        Ok(Arc::new(engine))
    }

    #[cfg(not(feature = "redis"))]
    fn build_redis(&self) -> Result<SharedEngine, ConfigError> {
        warn!("{ENGINE_VAR}=redis but redis feature not enabled, falling back to in-memory");
        Ok(Arc::new(InMemoryEngine::new()))
    }
}
