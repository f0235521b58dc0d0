//! Periodic background tick.
//!
//! Each tick enqueues a sync job for a user, then a classify job over the
//! user's current unclassified backlog. A user already inside a tick is
//! skipped. Ticks never fail; errors are logged and the tick ends.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::TickConfig;
use crate::error::Error;
use crate::store::StorageGateway;
use crate::worker::queue::JobQueue;
use crate::worker::registry::JobPayload;

/// What a tick did for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick for this user was still in progress.
    Skipped,
    Enqueued {
        sync_job: Uuid,
        /// `None` when there was no unclassified backlog.
        classify_job: Option<Uuid>,
    },
    /// Enqueueing stopped early. Jobs already enqueued keep running.
    Failed {
        sync_job: Option<Uuid>,
        error: String,
    },
}

pub struct BackgroundTicker {
    queue: Arc<JobQueue>,
    gateway: StorageGateway,
    config: TickConfig,
    active: std::sync::Mutex<HashSet<i64>>,
}

/// Marks a user as mid-tick until dropped.
pub struct ActiveGuard<'a> {
    ticker: &'a BackgroundTicker,
    user_id: i64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.ticker
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.user_id);
    }
}

impl BackgroundTicker {
    pub fn new(queue: Arc<JobQueue>, gateway: StorageGateway, config: TickConfig) -> Self {
        Self {
            queue,
            gateway,
            config,
            active: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Claim the user for a tick. `None` if a tick for them is in progress.
    pub fn try_activate(&self, user_id: i64) -> Option<ActiveGuard<'_>> {
        let inserted = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id);
        inserted.then_some(ActiveGuard {
            ticker: self,
            user_id,
        })
    }

    /// Run one tick for a user.
    pub async fn tick(&self, user_id: i64) -> TickOutcome {
        let Some(_guard) = self.try_activate(user_id) else {
            debug!(user_id, "Tick already in progress, skipping");
            return TickOutcome::Skipped;
        };

        let sync_job = match self
            .queue
            .enqueue(
                user_id,
                JobPayload::Sync {
                    max_results: self.config.sync_max_results,
                },
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(user_id, "Tick could not enqueue sync: {e}");
                return TickOutcome::Failed {
                    sync_job: None,
                    error: e.to_string(),
                };
            }
        };

        match self.enqueue_backlog(user_id).await {
            Ok(classify_job) => {
                info!(user_id, %sync_job, ?classify_job, "Tick enqueued jobs");
                TickOutcome::Enqueued {
                    sync_job,
                    classify_job,
                }
            }
            Err(e) => {
                error!(user_id, "Tick could not enqueue classification: {e}");
                TickOutcome::Failed {
                    sync_job: Some(sync_job),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Snapshot the unclassified backlog into a classify job.
    async fn enqueue_backlog(&self, user_id: i64) -> Result<Option<Uuid>, Error> {
        let backlog = {
            let session = self.gateway.session().await?;
            session
                .unclassified_messages(user_id, self.config.backlog_cap)
                .await?
        };
        if backlog.is_empty() {
            return Ok(None);
        }

        let message_ids = backlog.into_iter().map(|m| m.id).collect();
        let id = self
            .queue
            .enqueue(user_id, JobPayload::Classify { message_ids })
            .await?;
        Ok(Some(id))
    }

    /// Tick every user that has stored credentials, then prune old jobs.
    pub async fn tick_all(&self) {
        let users = match self.gateway.session().await {
            Ok(session) => session.list_users_with_credentials().await,
            Err(e) => Err(e),
        };
        let users = match users {
            Ok(users) => users,
            Err(e) => {
                error!("Failed to list users for tick: {e}");
                return;
            }
        };

        for user in users {
            self.tick(user.id).await;
        }

        let retention = self.queue.retention();
        self.queue.prune_finished(retention).await;
    }
}

/// Spawn the periodic tick loop.
///
/// Returns the task handle and a shutdown flag checked before each tick.
pub fn spawn_tick_loop(
    ticker: Arc<BackgroundTicker>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Background ticker started");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // First tick fires immediately.
        loop {
            timer.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Background ticker shutting down");
                return;
            }

            ticker.tick_all().await;
        }
    });

    (handle, shutdown_flag)
}
