//! Queue substrate adapters.
//!
//! The pipeline layers on an existing reliable-delivery queue; this module
//! holds the seam ([`TaskQueue`] / [`DeliveryHandler`]) and its backends.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod transport;

pub use memory::{DeadLetter, MemoryQueue, MemoryQueueConfig, QueueStats};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConfig, RedisStreamsQueue};
pub use transport::{DeliveryError, DeliveryHandler, DeliveryParams, QueueError, TaskInfo, TaskMessage, TaskQueue};
