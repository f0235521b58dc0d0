//! Gmail API v1 client over reqwest.
//!
//! - `list_message_ids`: one `users/me/messages` call, capped at 500 ids
//! - `get_message`: `format=full`
//! - `batch_get`: one multipart/mixed request to the batch endpoint,
//!   answered part-by-part so a single missing message doesn't sink the rest

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::MailError;
use crate::mail::auth::TokenProvider;
use crate::mail::{BatchItem, MailClient, MailConnector, RawMessage};

/// Hard cap the API applies to one listing page.
pub const MAX_LIST_RESULTS: u32 = 500;

/// Retry settings for transient API failures (429, 408, 5xx, connect/timeout).
#[derive(Debug, Clone)]
pub struct ApiRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ApiRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        }
    }
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_delay(
    attempt: u32,
    policy: &ApiRetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(secs) = retry_after
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        return Duration::from_secs(secs.min(30));
    }
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    policy
        .initial_backoff
        .saturating_mul(factor)
        .min(policy.max_backoff)
}

/// Send a request, retrying transient failures with exponential backoff.
async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &ApiRetryPolicy,
) -> Result<reqwest::Response, MailError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return Ok(request.send().await?);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if is_retryable(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    warn!(attempt, attempts, %status, ?delay, "Gmail API retry");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                if (err.is_timeout() || err.is_connect()) && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    warn!(attempt, attempts, error = %err, ?delay, "Gmail API retry after transport error");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(MailError::Http(err));
            }
        }
    }
    Err(MailError::Api {
        status: 0,
        message: "request exhausted retries".to_string(),
    })
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, MailError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(MailError::AuthExpired);
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(MailError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

/// Authenticated client for one mailbox.
pub struct GmailClient {
    http: reqwest::Client,
    api_base: String,
    token: SecretString,
    retry: ApiRetryPolicy,
}

impl GmailClient {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, token: SecretString) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
            retry: ApiRetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: ApiRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/gmail/v1/users/me/messages", self.api_base)
    }
}

#[async_trait]
impl MailClient for GmailClient {
    async fn list_message_ids(
        &self,
        query: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<String>, MailError> {
        let capped = max_results.min(MAX_LIST_RESULTS).to_string();
        let mut params = vec![("maxResults", capped.as_str())];
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            params.push(("q", q));
        }

        let request = self
            .http
            .get(self.messages_url())
            .bearer_auth(self.token.expose_secret())
            .query(&params);
        let response = check_status(send_with_retry(request, &self.retry).await?).await?;
        let list: MessageListResponse = response.json().await?;

        debug!(count = list.messages.len(), query, "Listed message ids");
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, MailError> {
        let request = self
            .http
            .get(format!("{}/{id}", self.messages_url()))
            .bearer_auth(self.token.expose_secret())
            .query(&[("format", "full")]);
        let response = check_status(send_with_retry(request, &self.retry).await?).await?;
        Ok(response.json().await?)
    }

    async fn batch_get(&self, ids: &[String]) -> Result<Vec<BatchItem>, MailError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let boundary = format!("batch_pare_{}", uuid::Uuid::new_v4().simple());
        let body = build_batch_body(ids, &boundary);
        let request = self
            .http
            .post(format!("{}/batch/gmail/v1", self.api_base))
            .bearer_auth(self.token.expose_secret())
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/mixed; boundary={boundary}"),
            )
            .body(body);
        let response = check_status(send_with_retry(request, &self.retry).await?).await?;

        let response_boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .ok_or_else(|| MailError::Batch("response has no multipart boundary".into()))?;
        let text = response.text().await?;

        let mut by_index = parse_batch_response(&text, &response_boundary);
        let items = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let result = by_index
                    .remove(&i)
                    .unwrap_or_else(|| Err(MailError::Batch(format!("no response part for {id}"))));
                (id.clone(), result)
            })
            .collect::<Vec<_>>();

        let failed = items.iter().filter(|(_, r)| r.is_err()).count();
        debug!(requested = ids.len(), failed, "Batch fetch complete");
        Ok(items)
    }
}

/// Multipart body with one `GET` per id, tagged `<item{index}>`.
pub fn build_batch_body(ids: &[String], boundary: &str) -> String {
    let mut body = String::new();
    for (i, id) in ids.iter().enumerate() {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Type: application/http\r\nContent-ID: <item{i}>\r\n\r\n\
             GET /gmail/v1/users/me/messages/{id}?format=full\r\n\r\n"
        ));
    }
    body.push_str(&format!("--{boundary}--\r\n"));
    body
}

pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Split a batch response into per-request results keyed by request index.
///
/// Parts without a recognizable `Content-ID` are dropped.
pub fn parse_batch_response(
    body: &str,
    boundary: &str,
) -> HashMap<usize, Result<RawMessage, MailError>> {
    let normalized = body.replace("\r\n", "\n");
    let delimiter = format!("--{boundary}");
    let mut results = HashMap::new();

    for part in normalized.split(delimiter.as_str()) {
        let part = part.trim_start_matches('\n');
        if part.is_empty() || part.starts_with("--") {
            continue;
        }
        let Some((outer_headers, inner)) = part.split_once("\n\n") else {
            continue;
        };
        let Some(index) = content_id_index(outer_headers) else {
            continue;
        };
        results.insert(index, parse_inner_response(inner));
    }
    results
}

fn content_id_index(headers: &str) -> Option<usize> {
    let value = headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-id")
            .then_some(value.trim())
    })?;
    let digits = value.rsplit_once("item")?.1;
    digits
        .trim_end_matches('>')
        .trim()
        .parse()
        .ok()
}

fn parse_inner_response(inner: &str) -> Result<RawMessage, MailError> {
    let inner = inner.trim_start();
    let (status_line, rest) = inner.split_once('\n').unwrap_or((inner, ""));
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MailError::Batch(format!("bad status line: {status_line}")))?;
    let json = rest.split_once("\n\n").map(|(_, b)| b).unwrap_or("").trim();

    match status {
        200..=299 => Ok(serde_json::from_str(json)?),
        401 => Err(MailError::AuthExpired),
        _ => Err(MailError::Api {
            status,
            message: json.to_string(),
        }),
    }
}

/// Connector that resolves tokens and builds [`GmailClient`]s.
pub struct GmailConnector {
    tokens: Arc<dyn TokenProvider>,
    http: reqwest::Client,
    api_base: String,
}

impl GmailConnector {
    pub fn new(tokens: Arc<dyn TokenProvider>, api_base: impl Into<String>) -> Self {
        Self {
            tokens,
            http: reqwest::Client::new(),
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl MailConnector for GmailConnector {
    async fn connect(&self, user_id: i64) -> Option<Arc<dyn MailClient>> {
        match self.tokens.access_token(user_id).await {
            Ok(Some(token)) => Some(Arc::new(GmailClient::new(
                self.http.clone(),
                self.api_base.clone(),
                token,
            ))),
            Ok(None) => {
                info!(user_id, "No stored credentials, skipping mailbox");
                None
            }
            Err(e) => {
                warn!(user_id, error = %e, "Could not obtain access token");
                None
            }
        }
    }
}
