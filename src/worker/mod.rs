//! Background job system.
//!
//! - `state`: job status machine and the per-job record pollers read
//! - `registry`: job kinds, typed payloads, handler lookup
//! - `queue`: channel-fed worker pool with panic isolation
//! - `handlers`: handlers that run the sync and classification pipelines
//! - `ticker`: periodic per-user sync + backlog classification

pub mod handlers;
pub mod queue;
pub mod registry;
pub mod state;
pub mod ticker;

pub use handlers::{ClassifyJobHandler, SyncJobHandler, default_registry};
pub use queue::JobQueue;
pub use registry::{JobContext, JobHandler, JobKind, JobPayload, JobRegistry};
pub use state::{JobSnapshot, JobStatus};
pub use ticker::{BackgroundTicker, TickOutcome, spawn_tick_loop};
