//! Queue engine abstraction.
//!
//! Implementations live in `jobkeeper-infra`; this crate only fixes the
//! contract the orchestration layer depends on.

pub mod engine;
pub mod error;

pub use engine::{QueueEngine, SharedEngine};
pub use error::{EngineError, EngineResult};
