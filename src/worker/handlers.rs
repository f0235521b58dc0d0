//! Job handlers that run the sync and classification pipelines.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, JobError};
use crate::pipeline::{ClassificationPipeline, SyncPipeline};
use crate::worker::registry::{JobContext, JobHandler, JobKind, JobPayload, JobRegistry};

pub struct SyncJobHandler {
    pipeline: Arc<SyncPipeline>,
}

impl SyncJobHandler {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for SyncJobHandler {
    async fn run(&self, ctx: &JobContext, payload: JobPayload) -> Result<serde_json::Value, Error> {
        let JobPayload::Sync { max_results } = payload else {
            return Err(mismatch(&payload));
        };
        let report = self.pipeline.sync_user(ctx.user_id, max_results, ctx).await?;
        Ok(serde_json::to_value(report).map_err(JobError::from)?)
    }
}

/// Runs both the fixed-snapshot and the backlog classification jobs.
pub struct ClassifyJobHandler {
    pipeline: Arc<ClassificationPipeline>,
}

impl ClassifyJobHandler {
    pub fn new(pipeline: Arc<ClassificationPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for ClassifyJobHandler {
    async fn run(&self, ctx: &JobContext, payload: JobPayload) -> Result<serde_json::Value, Error> {
        let report = match payload {
            JobPayload::Classify { message_ids } => {
                self.pipeline
                    .classify_messages(ctx.user_id, &message_ids, ctx)
                    .await?
            }
            JobPayload::ClassifyBacklog => self.pipeline.classify_backlog(ctx.user_id, ctx).await?,
            other => return Err(mismatch(&other)),
        };
        Ok(serde_json::to_value(report).map_err(JobError::from)?)
    }
}

fn mismatch(payload: &JobPayload) -> Error {
    JobError::PayloadMismatch {
        kind: payload.kind().to_string(),
    }
    .into()
}

/// Registry with every built-in job type wired to its pipeline.
pub fn default_registry(
    sync: Arc<SyncPipeline>,
    classification: Arc<ClassificationPipeline>,
) -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(JobKind::Sync, Arc::new(SyncJobHandler::new(sync)));

    let classify: Arc<dyn JobHandler> = Arc::new(ClassifyJobHandler::new(classification));
    registry.register(JobKind::Classify, Arc::clone(&classify));
    registry.register(JobKind::ClassifyBacklog, classify);
    registry
}
