//! Remote classification: request building and lenient response parsing.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::classify::Category;
use crate::classify::prompt::{ClassificationInput, SYSTEM_PROMPT, build_user_prompt};
use crate::config::ClassifierConfig;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

/// Meeting fields as returned by the classifier, before time resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeetingDetails {
    pub title: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub location: Option<String>,
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDetails {
    pub description: Option<String>,
    pub due_date: Option<String>,
}

/// A classification with the category already coerced into the taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub category: Category,
    /// Clamped to `[0, 1]`.
    pub confidence: f64,
    pub meeting: Option<MeetingDetails>,
    pub task: Option<TaskDetails>,
    pub unsubscribe_url: Option<String>,
    pub notes: Option<String>,
}

impl ClassificationResult {
    /// `other` with zero confidence.
    pub fn fallback(note: impl Into<String>) -> Self {
        Self {
            category: Category::Other,
            confidence: 0.0,
            meeting: None,
            task: None,
            unsubscribe_url: None,
            notes: Some(note.into()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawClassification {
    category: Option<String>,
    confidence: Option<serde_json::Value>,
    meeting: Option<RawMeeting>,
    task: Option<RawTask>,
    unsubscribe_url: Option<String>,
    unsubscribe: Option<RawUnsubscribe>,
    notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMeeting {
    title: Option<String>,
    #[serde(alias = "start")]
    start_time: Option<String>,
    #[serde(alias = "end")]
    end_time: Option<String>,
    location: Option<String>,
    attendees: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTask {
    description: Option<String>,
    due_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawUnsubscribe {
    url: Option<String>,
}

/// Why a classifier reply could not be read as a verdict.
#[derive(Debug, thiserror::Error)]
pub enum VerdictError {
    #[error("no JSON object in classifier reply")]
    NoObject,

    #[error("malformed verdict: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The outermost `{...}` span of a reply. Models wrap the verdict in prose or
/// a code fence often enough that the span is taken rather than the whole text.
pub fn verdict_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

/// Parse a classifier response. Unknown categories become `other`.
pub fn parse_classification(reply: &str) -> Result<ClassificationResult, VerdictError> {
    let json = verdict_json(reply).ok_or(VerdictError::NoObject)?;
    let parsed: RawClassification = serde_json::from_str(json)?;

    let category = parsed
        .category
        .as_deref()
        .map(Category::coerce)
        .unwrap_or(Category::Other);
    let known = parsed
        .category
        .as_deref()
        .is_some_and(|c| c.trim().eq_ignore_ascii_case(category.as_str()));
    // A coerced category carries no confidence.
    let confidence = if known {
        confidence_from(parsed.confidence.as_ref())
    } else {
        0.0
    };

    let meeting = parsed.meeting.map(|m| MeetingDetails {
        title: non_empty(m.title),
        start_time: non_empty(m.start_time),
        end_time: non_empty(m.end_time),
        location: non_empty(m.location),
        attendees: attendees_from(m.attendees),
    });
    let task = parsed.task.map(|t| TaskDetails {
        description: non_empty(t.description),
        due_date: non_empty(t.due_date),
    });
    let unsubscribe_url = non_empty(parsed.unsubscribe_url)
        .or_else(|| non_empty(parsed.unsubscribe.and_then(|u| u.url)))
        .filter(|u| {
            url::Url::parse(u).is_ok_and(|parsed| matches!(parsed.scheme(), "http" | "https"))
        });

    Ok(ClassificationResult {
        category,
        confidence,
        meeting,
        task,
        unsubscribe_url,
        notes: non_empty(parsed.notes),
    })
}

/// Classifies single messages through an [`LlmProvider`].
///
/// Without a provider every message classifies as `other` with zero
/// confidence.
pub struct EmailClassifier {
    llm: Option<Arc<dyn LlmProvider>>,
    temperature: f32,
}

impl EmailClassifier {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>, config: &ClassifierConfig) -> Self {
        if llm.is_none() {
            warn!("No classifier API key configured; messages will be classified as 'other'");
        }
        Self {
            llm,
            temperature: config.temperature,
        }
    }

    pub async fn classify(
        &self,
        input: &ClassificationInput,
    ) -> Result<ClassificationResult, LlmError> {
        let Some(llm) = &self.llm else {
            return Ok(ClassificationResult::fallback(
                "no API key configured; default classification applied",
            ));
        };

        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_user_prompt(input)),
        ])
        .with_temperature(self.temperature)
        .with_json_output();

        let response = llm.complete(request).await?;
        let result = parse_classification(&response.content).map_err(|e| {
            warn!(model = llm.model_name(), reply = %response.content, error = %e, "Unreadable verdict");
            LlmError::InvalidResponse {
                provider: llm.model_name().to_string(),
                reason: e.to_string(),
            }
        })?;

        debug!(
            category = %result.category,
            confidence = result.confidence,
            "Message classified"
        );
        Ok(result)
    }
}
