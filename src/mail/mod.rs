//! Remote mailbox access.
//!
//! - [`MailClient`]: list / get / batch-get against one user's mailbox
//! - [`MailConnector`]: resolves a user id to a ready client (or none when
//!   the user has no usable credentials)
//! - [`content`]: transport + charset decoding and MIME body extraction
//! - [`unsubscribe`]: unsubscribe link discovery

pub mod auth;
pub mod content;
pub mod gmail;
pub mod unsubscribe;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MailError;

pub use auth::{StoredTokenProvider, TokenProvider};
pub use content::ParsedMessage;
pub use gmail::{GmailClient, GmailConnector};

/// A full message as returned by the Gmail API (`format=full`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Epoch milliseconds, as a decimal string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePart>,
}

/// One node of the MIME tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<PartBody>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<MessagePart>,
}

impl MessagePart {
    /// First header with this name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    /// base64url content, possibly without padding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
}

/// Outcome for one id of a batch fetch.
pub type BatchItem = (String, Result<RawMessage, MailError>);

/// A user's remote mailbox.
#[async_trait]
pub trait MailClient: Send + Sync {
    /// Message ids matching `query`, newest first, at most `max_results`.
    async fn list_message_ids(
        &self,
        query: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<String>, MailError>;

    async fn get_message(&self, id: &str) -> Result<RawMessage, MailError>;

    /// Fetch many messages in one round trip.
    ///
    /// Returns one entry per requested id in request order; a failed item
    /// carries its own error. `Err` means the whole request failed.
    async fn batch_get(&self, ids: &[String]) -> Result<Vec<BatchItem>, MailError>;
}

/// Builds a [`MailClient`] for a user.
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// `None` when the user has no credentials or they could not be refreshed.
    async fn connect(&self, user_id: i64) -> Option<Arc<dyn MailClient>>;
}
