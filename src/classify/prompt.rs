//! Classification prompt construction.

use chrono::{DateTime, Utc};

use crate::store::StoredMessage;

pub const SYSTEM_PROMPT: &str = "You output concise JSON only.";

/// The fields of a message the classifier sees.
#[derive(Debug, Clone, Default)]
pub struct ClassificationInput {
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    /// Already truncated to the configured character cap.
    pub body: String,
}

impl ClassificationInput {
    /// Body falls back to the snippet; truncation counts characters, not bytes.
    pub fn from_message(message: &StoredMessage, body_char_limit: usize) -> Self {
        let body = message
            .body
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .or(message.snippet.as_deref())
            .unwrap_or_default();
        Self {
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            date: message.received_at,
            body: body.chars().take(body_char_limit).collect(),
        }
    }
}

/// Build the user prompt: taxonomy, response schema, date and hour rules,
/// then the message itself.
pub fn build_user_prompt(input: &ClassificationInput) -> String {
    let mut prompt = String::with_capacity(1024 + input.body.len());

    prompt.push_str(
        "Classify: meeting, task, junk, newsletter, or other.\n\
         JSON: {category, confidence (0-1), \
         meeting{title,start_time ISO8601,end_time,location,attendees[]}, \
         task{description,due_date ISO8601}, unsubscribe_url, notes}\n\
         Dates: ISO8601 format YYYY-MM-DDTHH:mm:ss, no timezone. Use 24-hour format.\n\
         Meetings: extract the time from the content (e.g. '8PM', '7:45PM', '6pm'). \
         Use the meeting start time, not arrival time. \
         'Tonight'/'today' = email date. 'Tomorrow' = email date +1 day. \
         PM times: '6pm' = 18:00, '4pm' = 16:00, '8pm' = 20:00, '12pm'/'noon' = 12:00. \
         AM times: '6am' = 06:00, '9am' = 09:00, '12am'/'midnight' = 00:00. \
         A time with no AM/PM from 1 to 11 (e.g. '6', '4') is PM (18:00, 16:00). \
         Only use the email sent time if no time is mentioned in the content. \
         End time: +1 hour if not specified.\n",
    );

    let date = input
        .date
        .map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default();
    prompt.push_str(&format!("Email date: {date}\n"));
    prompt.push_str(&format!(
        "From: {}\n",
        input.sender.as_deref().unwrap_or("Unknown")
    ));
    prompt.push_str(&format!(
        "Subject: {}\n",
        input.subject.as_deref().unwrap_or("No subject")
    ));
    prompt.push_str(&format!("Body: {}", input.body));
    prompt
}
