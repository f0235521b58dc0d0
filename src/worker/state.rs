//! Job state machine and the records the queue keeps per job.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::JobError;
use crate::worker::registry::JobKind;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a free worker.
    Queued,
    /// Picked up by a worker.
    Running,
    /// Handler returned a result.
    Complete,
    /// Handler returned an error or panicked.
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Running, Complete) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Everything a poller can see about a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub job_type: JobKind,
    pub user_id: i64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub progress: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Queue-owned record of one job. Only the worker running it writes
/// status, result and error.
#[derive(Debug, Clone)]
pub struct JobRecord {
    snapshot: JobSnapshot,
}

impl JobRecord {
    pub fn new(job_id: Uuid, job_type: JobKind, user_id: i64) -> Self {
        Self {
            snapshot: JobSnapshot {
                job_id,
                job_type,
                user_id,
                status: JobStatus::Queued,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                progress: serde_json::Map::new(),
                error: None,
                result: None,
            },
        }
    }

    pub fn status(&self) -> JobStatus {
        self.snapshot.status
    }

    pub fn user_id(&self) -> i64 {
        self.snapshot.user_id
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.completed_at
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot.clone()
    }

    /// Move to `target`, stamping `started_at` / `completed_at`.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), JobError> {
        let current = self.snapshot.status;
        if !current.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.snapshot.job_id,
                state: current.to_string(),
                target: target.to_string(),
            });
        }

        self.snapshot.status = target;
        match target {
            JobStatus::Running => self.snapshot.started_at = Some(Utc::now()),
            JobStatus::Complete | JobStatus::Failed => {
                self.snapshot.completed_at = Some(Utc::now())
            }
            JobStatus::Queued => {}
        }
        Ok(())
    }

    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), JobError> {
        self.transition_to(JobStatus::Complete)?;
        self.snapshot.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), JobError> {
        self.transition_to(JobStatus::Failed)?;
        self.snapshot.error = Some(error.into());
        Ok(())
    }

    pub fn set_progress(&mut self, key: &str, value: serde_json::Value) {
        self.snapshot.progress.insert(key.to_string(), value);
    }
}

/// The shared job table. Mutated only under its lock.
pub(crate) type JobTable = Arc<RwLock<HashMap<Uuid, JobRecord>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Complete));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Complete));
        assert!(!JobStatus::Complete.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Complete.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn record_lifecycle_stamps_times() {
        let mut record = JobRecord::new(Uuid::new_v4(), JobKind::Sync, 1);
        assert_eq!(record.status(), JobStatus::Queued);

        record.transition_to(JobStatus::Running).unwrap();
        assert!(record.snapshot().started_at.is_some());

        record.complete(serde_json::json!({"new_count": 3})).unwrap();
        let snap = record.snapshot();
        assert_eq!(snap.status, JobStatus::Complete);
        assert!(snap.completed_at.is_some());
        assert_eq!(snap.result.unwrap()["new_count"], 3);
    }

    #[test]
    fn terminal_record_cannot_fail_later() {
        let mut record = JobRecord::new(Uuid::new_v4(), JobKind::Sync, 1);
        record.transition_to(JobStatus::Running).unwrap();
        record.fail("boom").unwrap();
        assert!(matches!(
            record.complete(serde_json::Value::Null),
            Err(JobError::InvalidTransition { .. })
        ));
        assert_eq!(record.snapshot().error.as_deref(), Some("boom"));
    }

    #[test]
    fn snapshot_serializes_polling_fields() {
        let mut record = JobRecord::new(Uuid::new_v4(), JobKind::ClassifyBacklog, 9);
        record.set_progress("classified", serde_json::json!(4));
        let json = serde_json::to_value(record.snapshot()).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["job_type"], "classify_backlog");
        assert_eq!(json["progress"]["classified"], 4);
        assert!(json.get("error").is_none());
        assert!(json.get("started_at").is_none());
    }

    #[test]
    fn status_display_matches_serde() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Failed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }
}
