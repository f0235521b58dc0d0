//! Message classification.
//!
//! - [`Category`]: the closed taxonomy with fallback coercion
//! - [`prompt`]: request construction
//! - [`schedule`]: meeting time normalization and date-relative resolution
//! - [`EmailClassifier`]: one message in, one [`ClassificationResult`] out

mod category;
pub mod classifier;
pub mod prompt;
pub mod schedule;

pub use category::Category;
pub use classifier::{ClassificationResult, EmailClassifier, MeetingDetails, TaskDetails};
pub use prompt::ClassificationInput;
