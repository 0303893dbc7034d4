//! Queue engine implementations.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod retention;
pub mod schedule;

pub use memory::InMemoryEngine;
#[cfg(feature = "redis")]
pub use redis::RedisEngine;
