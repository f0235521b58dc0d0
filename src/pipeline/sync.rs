//! Mailbox sync.
//!
//! Flow for one user:
//! 1. Candidate window: `after:<watermark - overlap>` when a watermark exists
//! 2. One listing call for candidate ids
//! 3. Chunked membership check against stored ids
//! 4. Batch fetch of unknown ids; a failed item is logged and skipped
//! 5. Decode, extract the unsubscribe link, upsert by `(user, external_id)`
//!
//! No credentials, or a listing failure, gives a zero-effect report.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::DatabaseError;
use crate::mail::{MailConnector, ParsedMessage, RawMessage};
use crate::pipeline::ProgressSink;
use crate::store::{StorageGateway, StorageSession, SyncStats};

/// Outcome of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Ids returned by the listing call.
    pub synced_count: usize,
    /// Messages persisted by this run.
    pub new_count: usize,
    /// Listed ids that were already stored.
    pub skipped_count: usize,
    /// Unknown ids whose fetch or decode failed.
    pub failed_count: usize,
    pub total_messages: i64,
    pub classified_messages: i64,
    pub unclassified_messages: i64,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

impl SyncReport {
    fn empty(stats: SyncStats, started: Instant) -> Self {
        Self {
            synced_count: 0,
            new_count: 0,
            skipped_count: 0,
            failed_count: 0,
            total_messages: stats.total,
            classified_messages: stats.classified,
            unclassified_messages: stats.unclassified,
            duration_seconds: started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
        }
    }
}

/// Remote search query for the candidate window.
///
/// `None` means "most recent messages", no filter.
pub fn build_query(
    watermark: Option<DateTime<Utc>>,
    overlap: chrono::Duration,
    user_email: Option<&str>,
) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(watermark) = watermark {
        parts.push(format!("after:{}", (watermark - overlap).format("%Y/%m/%d")));
    }
    if let Some(email) = user_email.filter(|e| !e.is_empty()) {
        parts.push(format!("-from:\"{email}\""));
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

pub struct SyncPipeline {
    gateway: StorageGateway,
    connector: Arc<dyn MailConnector>,
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(gateway: StorageGateway, connector: Arc<dyn MailConnector>, config: SyncConfig) -> Self {
        Self {
            gateway,
            connector,
            config,
        }
    }

    /// Sync up to `max_results` recent messages for a user.
    ///
    /// Storage errors propagate; remote failures never do.
    pub async fn sync_user(
        &self,
        user_id: i64,
        max_results: u32,
        progress: &dyn ProgressSink,
    ) -> Result<SyncReport, DatabaseError> {
        let started = Instant::now();
        let session = self.gateway.session().await?;
        let before = session.sync_stats(user_id).await?;

        let Some(client) = self.connector.connect(user_id).await else {
            warn!(user_id, "No mail client available, sync skipped");
            return Ok(SyncReport::empty(before, started));
        };

        let user = session.get_user(user_id).await?;
        let watermark = session.latest_received_at(user_id).await?;
        let query = build_query(
            watermark,
            self.config.watermark_overlap,
            user.as_ref().map(|u| u.email.as_str()),
        );

        let listed = match client.list_message_ids(query.as_deref(), max_results).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(user_id, error = %e, "Listing failed, sync skipped");
                return Ok(SyncReport::empty(before, started));
            }
        };
        info!(user_id, count = listed.len(), query = ?query, "Listed candidate messages");
        progress.report("listed", json!(listed.len())).await;

        let existing = session.existing_external_ids(user_id, &listed).await?;
        let mut seen = HashSet::new();
        let new_ids: Vec<String> = listed
            .iter()
            .filter(|id| !existing.contains(*id) && seen.insert(id.as_str()))
            .cloned()
            .collect();
        let skipped_count = listed.len() - new_ids.len();
        debug!(user_id, new = new_ids.len(), skipped = skipped_count, "Duplicate check complete");

        let batch_size = self.config.fetch_batch_size.max(1);
        let total_batches = new_ids.len().div_ceil(batch_size);
        let mut new_count = 0;
        let mut failed_count = 0;

        for (n, chunk) in new_ids.chunks(batch_size).enumerate() {
            debug!(user_id, batch = n + 1, total_batches, size = chunk.len(), "Fetching batch");
            let items = match client.batch_get(chunk).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(user_id, batch = n + 1, error = %e, "Batch fetch failed");
                    failed_count += chunk.len();
                    continue;
                }
            };

            for (id, result) in items {
                match result {
                    Ok(mut raw) => {
                        if raw.id.is_empty() {
                            raw.id = id;
                        }
                        persist_message(&session, user_id, &raw).await?;
                        new_count += 1;
                    }
                    Err(e) => {
                        warn!(user_id, external_id = %id, error = %e, "Failed to fetch message");
                        failed_count += 1;
                    }
                }
            }

            progress
                .report("fetched", json!({ "batch": n + 1, "batches": total_batches, "new": new_count }))
                .await;
        }

        let after = session.sync_stats(user_id).await?;
        let report = SyncReport {
            synced_count: listed.len(),
            new_count,
            skipped_count,
            failed_count,
            total_messages: after.total,
            classified_messages: after.classified,
            unclassified_messages: after.unclassified,
            duration_seconds: started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
        };
        info!(
            user_id,
            new = report.new_count,
            skipped = report.skipped_count,
            failed = report.failed_count,
            duration_secs = report.duration_seconds,
            "Sync complete"
        );
        Ok(report)
    }
}

async fn persist_message(
    session: &StorageSession,
    user_id: i64,
    raw: &RawMessage,
) -> Result<i64, DatabaseError> {
    let parsed = ParsedMessage::from_raw(raw);
    let unsubscribe_url = parsed.unsubscribe_url();
    let raw_json = match serde_json::to_string(raw) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(user_id, external_id = %raw.id, error = %e, "Raw payload not stored");
            None
        }
    };

    let message_id = session
        .upsert_message(&parsed.into_new_message(user_id, raw_json))
        .await?;

    if let Some(url) = unsubscribe_url
        && !session.has_unsubscribe(message_id).await?
    {
        session.create_unsubscribe_if_absent(message_id, &url).await?;
    }
    Ok(message_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn query_without_watermark_or_email() {
        assert_eq!(build_query(None, chrono::Duration::days(1), None), None);
    }

    #[test]
    fn query_backs_off_one_day_and_excludes_self() {
        let watermark = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(
            build_query(Some(watermark), chrono::Duration::days(1), Some("me@example.com")).as_deref(),
            Some("after:2024/02/29 -from:\"me@example.com\"")
        );
    }

    #[tokio::test]
    async fn persisted_message_keeps_raw_payload() {
        use crate::mail::{Header, MessagePart};
        use crate::store::test_gateway;

        let (_dir, gateway) = test_gateway().await;
        let session = gateway.session().await.unwrap();
        let user = session.upsert_user("u@example.com").await.unwrap();
        let raw = RawMessage {
            id: "abc".into(),
            payload: Some(MessagePart {
                mime_type: "text/plain".into(),
                headers: vec![Header {
                    name: "List-Unsubscribe".into(),
                    value: "<https://lists.example/u/9>".into(),
                }],
                ..MessagePart::default()
            }),
            ..RawMessage::default()
        };

        let id = persist_message(&session, user, &raw).await.unwrap();

        let stored = session.get_message(user, id).await.unwrap().unwrap();
        let reparsed = ParsedMessage::from_raw_json(stored.raw_json.as_deref().unwrap()).unwrap();
        assert_eq!(reparsed.external_id, "abc");
        assert_eq!(reparsed.unsubscribe_url().as_deref(), Some("https://lists.example/u/9"));
        assert_eq!(
            session.get_unsubscribe(id).await.unwrap().unwrap().url,
            "https://lists.example/u/9"
        );
    }
}
