use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use roomstage_core::ImageStatus;
use roomstage_infra::jobs::{ExecutionOptions, StagingTask};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct StageRequest {
    pub image_id: String,
    pub original_url: String,
    pub room_type: Option<String>,
    pub style: Option<String>,
    pub seed: Option<i64>,
    #[serde(default)]
    pub options: StageOptions,
}

/// Optional delivery knobs. Negative or zero values mean "unset".
#[derive(Debug, Default, Deserialize)]
pub struct StageOptions {
    pub queue: Option<String>,
    pub retry_budget: Option<i64>,
    pub timeout_secs: Option<u64>,
    pub not_before: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

impl StageRequest {
    pub fn task(&self) -> StagingTask {
        let mut task = StagingTask::new(self.image_id.clone(), self.original_url.clone());
        if let Some(room_type) = &self.room_type {
            task = task.with_room_type(room_type.clone());
        }
        if let Some(style) = &self.style {
            task = task.with_style(style.clone());
        }
        if let Some(seed) = self.seed {
            task = task.with_seed(seed);
        }
        task
    }

    pub fn execution_options(&self) -> ExecutionOptions {
        let o = &self.options;
        let mut options = ExecutionOptions::default();
        if let Some(queue) = o.queue.as_deref().filter(|q| !q.trim().is_empty()) {
            options = options.with_queue(queue);
        }
        if let Some(budget) = o.retry_budget.and_then(|b| u32::try_from(b).ok()) {
            options = options.with_retry_budget(budget);
        }
        if let Some(secs) = o.timeout_secs.filter(|s| *s > 0) {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        if let Some(at) = o.not_before {
            options = options.with_not_before(at);
        }
        if let Some(at) = o.deadline {
            options = options.with_deadline(at);
        }
        options
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct StageAccepted {
    pub task_id: String,
    pub queue: String,
    pub image_id: String,
    pub status: ImageStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> StageRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn negative_retry_budget_is_unset() {
        let req = request(serde_json::json!({
            "image_id": "img-1",
            "original_url": "s3://b/k.jpg",
            "options": {"retry_budget": -1, "timeout_secs": 0}
        }));
        assert_eq!(req.execution_options(), ExecutionOptions::default());
    }

    #[test]
    fn maps_hints_and_options() {
        let req = request(serde_json::json!({
            "image_id": "img-1",
            "original_url": "s3://b/k.jpg",
            "style": "scandinavian",
            "seed": 7,
            "options": {"queue": "critical", "retry_budget": 0, "timeout_secs": 90}
        }));

        let task = req.task();
        assert_eq!(task.style.as_deref(), Some("scandinavian"));
        assert_eq!(task.seed, Some(7));

        let options = req.execution_options();
        assert_eq!(options.queue.as_deref(), Some("critical"));
        assert_eq!(options.retry_budget, Some(0));
        assert_eq!(options.timeout, Some(Duration::from_secs(90)));
    }
}
