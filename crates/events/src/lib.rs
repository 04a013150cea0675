//! `roomstage-events` — job status notifications and the pub/sub seam that
//! carries them to streaming clients.

pub mod bus;
pub mod in_memory_bus;
pub mod job_update;
pub mod publisher;

pub use bus::{EventBus, Keyed, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use job_update::{JobUpdateEvent, JobUpdateStatus};
pub use publisher::{EventPublisher, PublishError, PublishRetry, StatusPublisher};
