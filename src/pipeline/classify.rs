//! Backlog classification.
//!
//! Messages are classified `max_workers` at a time. Any per-message failure
//! is replaced by an `other`/0 classification so the message leaves the
//! unclassified set and is not retried forever.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::classify::schedule::{normalize_timestamp, resolve_meeting_times};
use crate::classify::{Category, ClassificationInput, ClassificationResult, EmailClassifier};
use crate::config::ClassifierConfig;
use crate::error::{DatabaseError, Error};
use crate::mail::ParsedMessage;
use crate::mail::content::unescape_html;
use crate::mail::unsubscribe::extract_unsubscribe_url;
use crate::pipeline::ProgressSink;
use crate::store::{Meeting, StorageGateway, StorageSession, StoredMessage, Task, TaskStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifyReport {
    /// Classified by the remote classifier.
    pub processed: usize,
    /// Fell back to `other`, or could not be recorded at all.
    pub failed: usize,
    /// Messages attempted.
    pub total: usize,
}

impl std::ops::AddAssign for ClassifyReport {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Classified,
    FellBack,
    /// Even the fallback row could not be written.
    Lost,
}

pub struct ClassificationPipeline {
    gateway: StorageGateway,
    classifier: Arc<EmailClassifier>,
    config: ClassifierConfig,
}

impl ClassificationPipeline {
    pub fn new(
        gateway: StorageGateway,
        classifier: Arc<EmailClassifier>,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            gateway,
            classifier,
            config,
        }
    }

    /// Classify every unclassified message for a user, newest first, one
    /// batch at a time.
    pub async fn classify_backlog(
        &self,
        user_id: i64,
        progress: &dyn ProgressSink,
    ) -> Result<ClassifyReport, DatabaseError> {
        let batch_size = self.config.batch_size.max(1);
        let mut report = ClassifyReport::default();

        loop {
            let batch = {
                let session = self.gateway.session().await?;
                session.unclassified_messages(user_id, batch_size).await?
            };
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();

            let outcomes = self.run_batch(batch).await;
            let batch_report = tally(&outcomes);
            report += batch_report;
            progress.report("classified", json!(report)).await;

            if outcomes.iter().all(|o| *o == ItemOutcome::Lost) {
                warn!(user_id, fetched, "Batch made no progress, stopping");
                break;
            }
            if fetched < batch_size {
                break;
            }
        }

        info!(
            user_id,
            processed = report.processed,
            failed = report.failed,
            "Backlog classification complete"
        );
        Ok(report)
    }

    /// Classify a fixed snapshot of message ids.
    ///
    /// Ids that are missing, hidden, or already classified are skipped.
    pub async fn classify_messages(
        &self,
        user_id: i64,
        message_ids: &[i64],
        progress: &dyn ProgressSink,
    ) -> Result<ClassifyReport, DatabaseError> {
        let batch_size = self.config.batch_size.max(1);
        let mut report = ClassifyReport::default();

        for chunk in message_ids.chunks(batch_size) {
            let mut batch = Vec::with_capacity(chunk.len());
            {
                let session = self.gateway.session().await?;
                for &id in chunk {
                    let Some(message) = session.get_message(user_id, id).await? else {
                        continue;
                    };
                    if message.hidden || !session.classifications_for(id).await?.is_empty() {
                        continue;
                    }
                    batch.push(message);
                }
            }

            let outcomes = self.run_batch(batch).await;
            report += tally(&outcomes);
            progress.report("classified", json!(report)).await;
        }

        info!(
            user_id,
            processed = report.processed,
            failed = report.failed,
            requested = message_ids.len(),
            "Snapshot classification complete"
        );
        Ok(report)
    }

    async fn run_batch(&self, batch: Vec<StoredMessage>) -> Vec<ItemOutcome> {
        let workers = self.config.max_workers.max(1);
        let pace = self.config.rate_delay / workers as u32;

        futures::stream::iter(batch)
            .map(|message| async move {
                let outcome = self.classify_one(&message).await;
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                outcome
            })
            .buffer_unordered(workers)
            .collect()
            .await
    }

    async fn classify_one(&self, message: &StoredMessage) -> ItemOutcome {
        match self.try_classify(message).await {
            Ok(()) => ItemOutcome::Classified,
            Err(e) => {
                warn!(message_id = message.id, error = %e, "Classification failed, recording fallback");
                match self.record_fallback(message).await {
                    Ok(()) => ItemOutcome::FellBack,
                    Err(e) => {
                        error!(message_id = message.id, error = %e, "Fallback classification not recorded");
                        ItemOutcome::Lost
                    }
                }
            }
        }
    }

    async fn try_classify(&self, message: &StoredMessage) -> Result<(), Error> {
        let input = ClassificationInput::from_message(message, self.config.body_char_limit);
        let result = self.classifier.classify(&input).await?;

        let session = self.gateway.session().await?;
        session
            .upsert_classification(message.id, result.category, result.confidence)
            .await?;

        match result.category {
            Category::Meeting => session.upsert_meeting(&meeting_projection(message, &input, &result)).await?,
            Category::Task => session.upsert_task(&task_projection(message, &result)).await?,
            _ => {}
        }

        record_unsubscribe(&session, message, result.unsubscribe_url.clone()).await?;

        debug!(message_id = message.id, category = %result.category, "Message classification stored");
        Ok(())
    }

    /// `other`/0 row for a message the classifier could not handle. The
    /// unsubscribe link is still looked up from what was stored at sync time.
    async fn record_fallback(&self, message: &StoredMessage) -> Result<(), DatabaseError> {
        let session = self.gateway.session().await?;
        session
            .upsert_classification(message.id, Category::Other, 0.0)
            .await?;
        if let Err(e) = record_unsubscribe(&session, message, None).await {
            warn!(message_id = message.id, error = %e, "Unsubscribe link not recorded after fallback");
        }
        Ok(())
    }
}

fn tally(outcomes: &[ItemOutcome]) -> ClassifyReport {
    let processed = outcomes
        .iter()
        .filter(|o| **o == ItemOutcome::Classified)
        .count();
    ClassifyReport {
        processed,
        failed: outcomes.len() - processed,
        total: outcomes.len(),
    }
}

fn meeting_projection(
    message: &StoredMessage,
    input: &ClassificationInput,
    result: &ClassificationResult,
) -> Meeting {
    let details = result.meeting.clone().unwrap_or_default();
    let text = format!(
        "{}\n{}",
        message.subject.as_deref().unwrap_or_default(),
        input.body
    );
    let (start_time, end_time) = resolve_meeting_times(
        details.start_time.as_deref(),
        details.end_time.as_deref(),
        &text,
        message.received_at.map(|d| d.date_naive()),
    );

    Meeting {
        message_id: message.id,
        title: details
            .title
            .or_else(|| message.subject.clone())
            .map(|t| unescape_html(&t)),
        start_time,
        end_time,
        location: details.location.map(|l| unescape_html(&l)),
        attendees: details.attendees,
        confidence: result.confidence,
    }
}

fn task_projection(message: &StoredMessage, result: &ClassificationResult) -> Task {
    let details = result.task.clone().unwrap_or_default();
    Task {
        message_id: message.id,
        description: details
            .description
            .or_else(|| message.subject.clone())
            .map(|d| unescape_html(&d)),
        due_date: details
            .due_date
            .map(|d| normalize_timestamp(&d).unwrap_or(d)),
        status: TaskStatus::Pending,
        confidence: result.confidence,
    }
}

/// Store an unsubscribe entry unless one exists. A link named by the
/// classifier wins over one found in the stored message.
async fn record_unsubscribe(
    session: &StorageSession,
    message: &StoredMessage,
    suggested: Option<String>,
) -> Result<(), DatabaseError> {
    if session.has_unsubscribe(message.id).await? {
        return Ok(());
    }
    if let Some(url) = suggested.or_else(|| stored_unsubscribe_url(message)) {
        session.create_unsubscribe_if_absent(message.id, &url).await?;
    }
    Ok(())
}

/// Unsubscribe link from the stored payload, else from the stored body.
fn stored_unsubscribe_url(message: &StoredMessage) -> Option<String> {
    message
        .raw_json
        .as_deref()
        .and_then(ParsedMessage::from_raw_json)
        .and_then(|parsed| parsed.unsubscribe_url())
        .or_else(|| {
            let body = message.body.as_deref().or(message.snippet.as_deref())?;
            extract_unsubscribe_url(None, body)
        })
}
