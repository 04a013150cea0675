//! Job types shared by the bridge, processor and worker pool.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bridge-local job identifier.
///
/// Minted per delivery and time ordered; never persisted or compared across
/// processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A delivered task as handed to the job processor.
#[derive(Debug, Clone)]
pub struct BridgeJob {
    pub id: JobId,
    pub task_type: String,
    pub payload: Vec<u8>,
    /// Cancelled when the delivery times out or the consumer shuts down.
    pub ctx: CancellationToken,
    /// The bridge's shutdown token; tells a shutdown apart from a timeout.
    pub shutdown: CancellationToken,
}

impl BridgeJob {
    /// True once the bridge has been shut down. A cancelled job whose bridge
    /// is still running lost its delivery to a timeout or deadline.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique() {
        let ids: std::collections::HashSet<JobId> = (0..1_000).map(|_| JobId::new()).collect();
        assert_eq!(ids.len(), 1_000);
        assert_eq!(ids.iter().next().map(|id| id.0.get_version_num()), Some(7));
    }
}
