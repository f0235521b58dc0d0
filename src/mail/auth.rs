//! Access-token resolution for stored OAuth credentials.
//!
//! Tokens live in the `credentials` table. A token within 60 seconds of
//! expiry is refreshed against the OAuth token endpoint and the refreshed
//! value is written back before use.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::GoogleConfig;
use crate::error::MailError;
use crate::store::{StorageGateway, StoredCredentials};

/// Margin before expiry at which a token is treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Supplies a usable access token for a user.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// `Ok(None)` when the user has no stored credentials at all.
    async fn access_token(&self, user_id: i64) -> Result<Option<SecretString>, MailError>;
}

/// Whether a token expiring at `expiry` must be refreshed at `now`.
///
/// Unknown expiry is trusted; the API answers 401 if it is stale.
pub fn needs_refresh(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expiry {
        Some(expiry) => expiry <= now + Duration::seconds(EXPIRY_SKEW_SECS),
        None => false,
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Token provider backed by the credentials table.
pub struct StoredTokenProvider {
    gateway: StorageGateway,
    google: GoogleConfig,
    http: reqwest::Client,
    /// Serializes refreshes so concurrent callers don't race the endpoint.
    refresh_lock: Mutex<()>,
}

impl StoredTokenProvider {
    pub fn new(gateway: StorageGateway, google: GoogleConfig) -> Self {
        Self {
            gateway,
            google,
            http: reqwest::Client::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    async fn refresh(&self, creds: &StoredCredentials) -> Result<SecretString, MailError> {
        let _guard = self.refresh_lock.lock().await;

        let refresh_token = creds
            .refresh_token
            .as_deref()
            .ok_or(MailError::AuthExpired)?;

        let form = [
            ("client_id", self.google.client_id.as_str()),
            ("client_secret", self.google.client_secret.expose_secret()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let resp = self
            .http
            .post(&self.google.token_url)
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(map_refresh_error(status.as_u16(), &body));
        }

        let parsed: RefreshResponse = serde_json::from_str(&body)?;
        let expiry = Utc::now() + Duration::seconds(parsed.expires_in.unwrap_or(3600));

        let session = self.gateway.session().await?;
        session
            .upsert_credentials(
                creds.user_id,
                &parsed.access_token,
                parsed.refresh_token.as_deref(),
                Some(expiry),
            )
            .await?;

        info!(user_id = creds.user_id, %expiry, "Access token refreshed");
        Ok(SecretString::from(parsed.access_token))
    }
}

fn map_refresh_error(status: u16, body: &str) -> MailError {
    let lowered = body.to_lowercase();
    if (status == 400 || status == 401) && lowered.contains("invalid_grant") {
        return MailError::AuthExpired;
    }
    MailError::RefreshFailed(format!("HTTP {status}: {body}"))
}

#[async_trait]
impl TokenProvider for StoredTokenProvider {
    async fn access_token(&self, user_id: i64) -> Result<Option<SecretString>, MailError> {
        let session = self.gateway.session().await?;
        let Some(creds) = session.get_credentials(user_id).await? else {
            return Ok(None);
        };
        drop(session);

        match creds.access_token.as_deref() {
            Some(token) if !needs_refresh(creds.token_expiry, Utc::now()) => {
                debug!(user_id, "Using stored access token");
                Ok(Some(SecretString::from(token.to_string())))
            }
            _ => self.refresh(&creds).await.map(Some),
        }
    }
}
