//! In-process job queue.
//!
//! Jobs go into an unbounded channel; a fixed pool of worker tasks pulls
//! from it. Every handler runs in its own spawned task so a panic lands as
//! a `Failed` job instead of taking the worker down. Job records live in a
//! shared table that pollers read through [`JobQueue::get_job`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::JobError;
use crate::worker::registry::{JobContext, JobPayload, JobRegistry};
use crate::worker::state::{JobRecord, JobSnapshot, JobStatus, JobTable};

struct QueuedJob {
    id: Uuid,
    user_id: i64,
    payload: JobPayload,
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>;

pub struct JobQueue {
    jobs: JobTable,
    registry: Arc<JobRegistry>,
    sender: std::sync::Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    retention: Duration,
}

impl JobQueue {
    /// Create the queue and spawn its worker pool.
    pub fn start(registry: Arc<JobRegistry>, config: &QueueConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));
        let jobs: JobTable = Arc::new(RwLock::new(HashMap::new()));

        let worker_count = config.workers.max(1);
        let handles = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&rx),
                    Arc::clone(&jobs),
                    Arc::clone(&registry),
                ))
            })
            .collect();

        info!(workers = worker_count, "Job queue started");

        Arc::new(Self {
            jobs,
            registry,
            sender: std::sync::Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            retention: config.retention,
        })
    }

    /// Record a queued job and hand it to the pool. Returns immediately.
    pub async fn enqueue(&self, user_id: i64, payload: JobPayload) -> Result<Uuid, JobError> {
        let kind = payload.kind();
        if !self.registry.contains(kind) {
            return Err(JobError::UnknownKind {
                kind: kind.to_string(),
            });
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(JobError::QueueClosed)?;

        let id = Uuid::new_v4();
        self.jobs
            .write()
            .await
            .insert(id, JobRecord::new(id, kind, user_id));

        if sender.send(QueuedJob { id, user_id, payload }).is_err() {
            self.jobs.write().await.remove(&id);
            return Err(JobError::QueueClosed);
        }

        debug!(job_id = %id, user_id, job_type = %kind, "Job enqueued");
        Ok(id)
    }

    #[cfg(test)]
    pub(crate) fn jobs_table(&self) -> &JobTable {
        &self.jobs
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobSnapshot, JobError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .map(JobRecord::snapshot)
            .ok_or(JobError::NotFound { id })
    }

    /// All known jobs for a user, oldest first.
    pub async fn jobs_for_user(&self, user_id: i64) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|record| record.user_id() == user_id)
            .map(JobRecord::snapshot)
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Drop terminal jobs that finished more than `older_than` ago.
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, record| {
            !(record.status().is_terminal()
                && record.completed_at().is_some_and(|at| at < cutoff))
        });
        let pruned = before - jobs.len();
        if pruned > 0 {
            debug!(pruned, "Pruned finished jobs");
        }
        pruned
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Stop accepting jobs and wait for the workers to drain the channel.
    pub async fn shutdown(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Job worker ended abnormally: {e}");
            }
        }
        info!("Job queue stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: SharedReceiver,
    jobs: JobTable,
    registry: Arc<JobRegistry>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(job) = next else {
            debug!(worker_id, "Job channel closed, worker exiting");
            return;
        };
        run_job(worker_id, job, &jobs, &registry).await;
    }
}

async fn run_job(worker_id: usize, job: QueuedJob, jobs: &JobTable, registry: &JobRegistry) {
    let QueuedJob {
        id,
        user_id,
        payload,
    } = job;
    let kind = payload.kind();

    if let Err(e) = update(jobs, id, |record| record.transition_to(JobStatus::Running)).await {
        warn!(job_id = %id, "Could not start job: {e}");
        return;
    }
    info!(worker_id, job_id = %id, user_id, job_type = %kind, "Job started");

    let Some(handler) = registry.get(kind) else {
        let reason = JobError::UnknownKind {
            kind: kind.to_string(),
        }
        .to_string();
        finish(jobs, id, Err(reason)).await;
        return;
    };

    let ctx = JobContext::new(id, user_id, Arc::clone(jobs));
    let outcome = tokio::spawn(async move { handler.run(&ctx, payload).await }).await;

    let result = match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(JobError::Panicked(e.to_string()).to_string()),
    };
    match &result {
        Ok(_) => info!(job_id = %id, job_type = %kind, "Job complete"),
        Err(reason) => error!(job_id = %id, job_type = %kind, "Job failed: {reason}"),
    }
    finish(jobs, id, result).await;
}

async fn finish(jobs: &JobTable, id: Uuid, result: Result<serde_json::Value, String>) {
    let outcome = update(jobs, id, |record| match result {
        Ok(value) => record.complete(value),
        Err(reason) => record.fail(reason),
    })
    .await;
    if let Err(e) = outcome {
        warn!(job_id = %id, "Could not record job outcome: {e}");
    }
}

async fn update<F>(jobs: &JobTable, id: Uuid, f: F) -> Result<(), JobError>
where
    F: FnOnce(&mut JobRecord) -> Result<(), JobError>,
{
    let mut jobs = jobs.write().await;
    let record = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
    f(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::worker::registry::{JobHandler, JobKind};
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, ctx: &JobContext, payload: JobPayload) -> Result<serde_json::Value, Error> {
            ctx.set_progress("stage", json!("echo")).await;
            match payload {
                JobPayload::Sync { max_results } => Ok(json!({ "max_results": max_results })),
                other => Err(JobError::PayloadMismatch {
                    kind: other.kind().to_string(),
                }
                .into()),
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn run(&self, _ctx: &JobContext, _payload: JobPayload) -> Result<serde_json::Value, Error> {
            panic!("handler blew up");
        }
    }

    fn echo() -> Arc<dyn JobHandler> {
        Arc::new(Echo)
    }

    fn queue_with(handlers: Vec<(JobKind, Arc<dyn JobHandler>)>) -> Arc<JobQueue> {
        let mut registry = JobRegistry::new();
        for (kind, handler) in handlers {
            registry.register(kind, handler);
        }
        JobQueue::start(
            Arc::new(registry),
            &QueueConfig {
                workers: 2,
                retention: Duration::from_secs(60),
            },
        )
    }

    async fn wait_terminal(queue: &JobQueue, id: Uuid) -> JobSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = queue.get_job(id).await.unwrap();
                if job.status.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not finish")
    }

    #[tokio::test]
    async fn job_completes_with_result_and_progress() {
        let queue = queue_with(vec![(JobKind::Sync, echo())]);
        let id = queue.enqueue(7, JobPayload::Sync { max_results: 12 }).await.unwrap();

        let job = wait_terminal(&queue, id).await;
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.result.unwrap()["max_results"], 12);
        assert_eq!(job.progress["stage"], "echo");
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn handler_error_marks_job_failed() {
        let queue = queue_with(vec![(JobKind::ClassifyBacklog, echo())]);
        let id = queue.enqueue(1, JobPayload::ClassifyBacklog).await.unwrap();

        let job = wait_terminal(&queue, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("classify_backlog"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_handler_fails_job_and_worker_survives() {
        let queue = queue_with(vec![
            (JobKind::Classify, Arc::new(Panics) as Arc<dyn JobHandler>),
            (JobKind::Sync, echo()),
        ]);

        let bad = queue
            .enqueue(1, JobPayload::Classify { message_ids: vec![1] })
            .await
            .unwrap();
        let job = wait_terminal(&queue, bad).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("panicked"));

        let good = queue.enqueue(1, JobPayload::Sync { max_results: 1 }).await.unwrap();
        assert_eq!(wait_terminal(&queue, good).await.status, JobStatus::Complete);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_kind_rejected_at_enqueue() {
        let queue = queue_with(vec![]);
        let err = queue.enqueue(1, JobPayload::ClassifyBacklog).await.unwrap_err();
        assert!(matches!(err, JobError::UnknownKind { .. }));
        assert!(queue.jobs_for_user(1).await.is_empty());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let queue = queue_with(vec![(JobKind::Sync, echo())]);
        queue.shutdown().await;
        let err = queue.enqueue(1, JobPayload::Sync { max_results: 1 }).await.unwrap_err();
        assert!(matches!(err, JobError::QueueClosed));
    }

    #[tokio::test]
    async fn get_unknown_job_is_not_found() {
        let queue = queue_with(vec![]);
        let err = queue.get_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn prune_removes_only_finished_jobs() {
        let queue = queue_with(vec![(JobKind::Sync, echo())]);
        let id = queue.enqueue(3, JobPayload::Sync { max_results: 1 }).await.unwrap();
        wait_terminal(&queue, id).await;

        assert_eq!(queue.prune_finished(Duration::from_secs(3600)).await, 0);
        assert_eq!(queue.prune_finished(Duration::ZERO).await, 1);
        assert!(queue.jobs_for_user(3).await.is_empty());
        queue.shutdown().await;
    }
}
