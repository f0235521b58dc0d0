//! Job types, typed payloads, and the handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::pipeline::ProgressSink;
use crate::worker::state::JobTable;

/// Job type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Classify,
    ClassifyBacklog,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Classify => "classify",
            Self::ClassifyBacklog => "classify_backlog",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input for a job. The variant decides which handler runs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Sync { max_results: u32 },
    /// Classify exactly these message ids.
    Classify { message_ids: Vec<i64> },
    /// Classify whatever is unclassified when the job runs.
    ClassifyBacklog,
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Sync { .. } => JobKind::Sync,
            Self::Classify { .. } => JobKind::Classify,
            Self::ClassifyBacklog => JobKind::ClassifyBacklog,
        }
    }
}

/// Handle a running job uses to publish progress.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub user_id: i64,
    jobs: JobTable,
}

impl JobContext {
    pub(crate) fn new(job_id: Uuid, user_id: i64, jobs: JobTable) -> Self {
        Self {
            job_id,
            user_id,
            jobs,
        }
    }

    pub async fn set_progress(&self, key: &str, value: serde_json::Value) {
        if let Some(record) = self.jobs.write().await.get_mut(&self.job_id) {
            record.set_progress(key, value);
        }
    }
}

#[async_trait]
impl ProgressSink for JobContext {
    async fn report(&self, key: &str, value: serde_json::Value) {
        self.set_progress(key, value).await;
    }
}

/// Executes one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. The returned value becomes the job's result.
    async fn run(&self, ctx: &JobContext, payload: JobPayload) -> Result<serde_json::Value, Error>;
}

/// Maps job kinds to handlers.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `kind`.
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, _ctx: &JobContext, payload: JobPayload) -> Result<serde_json::Value, Error> {
            Ok(serde_json::to_value(payload).unwrap())
        }
    }

    #[test]
    fn payload_kind_mapping() {
        assert_eq!(JobPayload::Sync { max_results: 5 }.kind(), JobKind::Sync);
        assert_eq!(
            JobPayload::Classify { message_ids: vec![1] }.kind(),
            JobKind::Classify
        );
        assert_eq!(JobPayload::ClassifyBacklog.kind(), JobKind::ClassifyBacklog);
    }

    #[test]
    fn payload_serializes_tagged() {
        let json = serde_json::to_value(JobPayload::Sync { max_results: 50 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "sync", "max_results": 50}));
    }

    #[test]
    fn registry_lookup() {
        let mut registry = JobRegistry::new();
        registry.register(JobKind::Sync, Arc::new(Echo));
        assert!(registry.contains(JobKind::Sync));
        assert!(registry.get(JobKind::Classify).is_none());
    }
}
