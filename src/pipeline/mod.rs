//! Background pipelines driven by jobs.
//!
//! - [`SyncPipeline`]: list → dedup → batch fetch → decode → upsert
//! - [`ClassificationPipeline`]: unclassified selection → bounded concurrent
//!   classification → classification row + projections
//!
//! Both report progress through a [`ProgressSink`] so the job that runs them
//! can expose it to pollers.

pub mod classify;
pub mod sync;

pub use classify::{ClassificationPipeline, ClassifyReport};
pub use sync::{SyncPipeline, SyncReport};

use async_trait::async_trait;

/// Receives progress updates from a running pipeline.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, key: &str, value: serde_json::Value);
}

/// Discards progress.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _key: &str, _value: serde_json::Value) {}
}
