//! Shared fakes for the integration tests: an in-memory mailbox, a
//! connector handing it out, and a canned classifier backend.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use pare::config::StoreConfig;
use pare::error::{LlmError, MailError};
use pare::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use pare::mail::{BatchItem, Header, MailClient, MailConnector, MessagePart, PartBody, RawMessage};
use pare::store::StorageGateway;
use pare::worker::{JobQueue, JobSnapshot};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn open_gateway() -> (tempfile::TempDir, StorageGateway) {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        db_path: dir.path().join("pare.db"),
        ..StoreConfig::default()
    };
    let gateway = StorageGateway::open(&config).await.unwrap();
    (dir, gateway)
}

/// A plain-text message as the remote API would return it.
pub fn raw_message(id: &str, subject: &str, body: &str, received_at: DateTime<Utc>) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        snippet: Some(body.chars().take(40).collect()),
        internal_date: Some(received_at.timestamp_millis().to_string()),
        payload: Some(MessagePart {
            mime_type: "text/plain".into(),
            headers: vec![
                Header {
                    name: "From".into(),
                    value: "Sender <sender@example.com>".into(),
                },
                Header {
                    name: "Subject".into(),
                    value: subject.into(),
                },
            ],
            body: Some(PartBody {
                data: Some(URL_SAFE_NO_PAD.encode(body.as_bytes())),
                ..PartBody::default()
            }),
            ..MessagePart::default()
        }),
        ..RawMessage::default()
    }
}

/// In-memory mailbox. Listing returns ids in insertion order.
#[derive(Default)]
pub struct FakeMailbox {
    order: Mutex<Vec<String>>,
    messages: Mutex<HashMap<String, RawMessage>>,
    broken: Mutex<HashSet<String>>,
}

impl FakeMailbox {
    pub async fn add(&self, raw: RawMessage) {
        self.order.lock().await.push(raw.id.clone());
        self.messages.lock().await.insert(raw.id.clone(), raw);
    }

    /// Add `count` messages `m0..m{count}` received on 2024-01-01.
    pub async fn fill(&self, count: usize) {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        for i in 0..count {
            let at = base + chrono::Duration::minutes(i as i64);
            self.add(raw_message(&format!("m{i}"), &format!("Message {i}"), "Hello there", at))
                .await;
        }
    }

    /// Make fetches of `id` fail.
    pub async fn break_message(&self, id: &str) {
        self.broken.lock().await.insert(id.to_string());
    }

    async fn fetch(&self, id: &str) -> Result<RawMessage, MailError> {
        if self.broken.lock().await.contains(id) {
            return Err(MailError::Api {
                status: 500,
                message: "backend error".into(),
            });
        }
        self.messages
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MailError::Api {
                status: 404,
                message: "not found".into(),
            })
    }
}

#[async_trait]
impl MailClient for FakeMailbox {
    async fn list_message_ids(
        &self,
        _query: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<String>, MailError> {
        let order = self.order.lock().await;
        Ok(order.iter().take(max_results as usize).cloned().collect())
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, MailError> {
        self.fetch(id).await
    }

    async fn batch_get(&self, ids: &[String]) -> Result<Vec<BatchItem>, MailError> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            items.push((id.clone(), self.fetch(id).await));
        }
        Ok(items)
    }
}

/// Hands out the same mailbox for every user, or nothing.
pub struct FakeConnector {
    pub mailbox: Option<Arc<FakeMailbox>>,
}

#[async_trait]
impl MailConnector for FakeConnector {
    async fn connect(&self, _user_id: i64) -> Option<Arc<dyn MailClient>> {
        self.mailbox
            .clone()
            .map(|mailbox| mailbox as Arc<dyn MailClient>)
    }
}

/// Replies with the first canned answer whose key occurs in the prompt.
pub struct CannedLlm {
    pub replies: Vec<(&'static str, &'static str)>,
    pub default: &'static str,
}

#[async_trait]
impl LlmProvider for CannedLlm {
    fn model_name(&self) -> &str {
        "canned"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let content = self
            .replies
            .iter()
            .find(|(key, _)| prompt.contains(key))
            .map(|(_, reply)| *reply)
            .unwrap_or(self.default);
        Ok(CompletionResponse {
            content: content.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

/// Poll until the job is `complete` or `failed`.
pub async fn wait_for_terminal(queue: &JobQueue, id: Uuid) -> JobSnapshot {
    loop {
        let job = queue.get_job(id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
