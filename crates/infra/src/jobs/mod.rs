//! Asynchronous staging job pipeline.
//!
//! ## Flow
//!
//! ```text
//! TaskEnqueuer ─► queue substrate ─► ConsumerBridge ─► WorkerPool ─► JobProcessor
//!                                         ▲                              │
//!                                         └── mark_job_completed/failed ─┘
//! ```
//!
//! ## Components
//!
//! - `StagingTask`: wire contract shared by producer and consumer
//! - `TaskEnqueuer`: validates and submits tasks with `ExecutionOptions`
//! - `ConsumerBridge`: push→pull adapter with a correlation table
//! - `JobProcessor`: per-image state machine (`queued → processing → ready|error`)
//! - `WorkerPool`: polls the bridge and reports outcomes

pub mod bridge;
pub mod processor;
pub mod submit;
pub mod task;
pub mod types;
pub mod worker;

pub use bridge::ConsumerBridge;
pub use processor::{JobProcessor, ProcessError};
pub use submit::{ExecutionOptions, SubmitError, TaskEnqueuer};
pub use task::{StagingTask, TASK_TYPE_STAGE};
pub use types::{BridgeJob, JobId};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};
