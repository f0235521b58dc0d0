//! Persisted entity types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::Category;

/// A mailbox owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
}

/// OAuth tokens stored for a user.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub user_id: i64,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
}

/// Message content as produced by a sync, keyed by `(user_id, external_id)`.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub user_id: i64,
    pub external_id: String,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub body: Option<String>,
    pub snippet: Option<String>,
    /// The remote payload as JSON, kept for later link extraction.
    pub raw_json: Option<String>,
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: i64,
    pub external_id: String,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub body: Option<String>,
    pub snippet: Option<String>,
    #[serde(skip)]
    pub raw_json: Option<String>,
    pub hidden: bool,
    pub created_at: DateTime<Utc>,
}

/// One `(message, category)` classification row.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub message_id: i64,
    pub category: Category,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// Meeting projection of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Meeting {
    pub message_id: i64,
    pub title: Option<String>,
    /// Local wall-clock time, `YYYY-MM-DDTHH:MM:SS`.
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub location: Option<String>,
    pub attendees: Vec<String>,
    pub confidence: f64,
}

/// Task status. Set to `Pending` on creation and only changed by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            _ => Self::Pending,
        }
    }
}

/// Task projection of a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub message_id: i64,
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub status: TaskStatus,
    pub confidence: f64,
}

/// Unsubscribe projection of a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnsubscribeEntry {
    pub message_id: i64,
    pub url: String,
    pub status: String,
}

/// Per-user message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub total: i64,
    pub classified: i64,
    pub unclassified: i64,
}
