//! Error types for pare.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    /// Storage stayed locked after every retry attempt.
    #[error("Database busy after {attempts} attempts: {reason}")]
    Busy { attempts: u32, reason: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Remote mailbox and credential errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token expired or revoked")]
    AuthExpired,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed batch response: {0}")]
    Batch(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Credential storage: {0}")]
    Storage(#[from] DatabaseError),
}

/// Remote classification transport errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("No handler registered for job type {kind}")]
    UnknownKind { kind: String },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Job queue is shut down")]
    QueueClosed,

    #[error("Payload does not match handler {kind}")]
    PayloadMismatch { kind: String },

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Failed to encode job result: {0}")]
    ResultEncoding(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
