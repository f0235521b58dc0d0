//! Configuration types.
//!
//! Every struct reads its overrides from the environment in `from_env()` and
//! falls back to the `Default` values for anything unset or unparsable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(SecretString::from)
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Attempts made for a write that hits a locked database.
    pub busy_retry_attempts: u32,
    /// Backoff unit; attempt `n` sleeps `n * busy_backoff`.
    pub busy_backoff: Duration,
    /// Per-connection busy timeout handed to SQLite.
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/pare.db"),
            busy_retry_attempts: 3,
            busy_backoff: Duration::from_millis(100),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_path: std::env::var("PARE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
            busy_retry_attempts: env_parse("PARE_DB_BUSY_RETRIES", d.busy_retry_attempts),
            busy_backoff: Duration::from_millis(env_parse(
                "PARE_DB_BUSY_BACKOFF_MS",
                d.busy_backoff.as_millis() as u64,
            )),
            busy_timeout: d.busy_timeout,
        }
    }
}

/// Job queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of worker tasks pulling from the queue.
    pub workers: usize,
    /// How long finished jobs stay pollable.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            retention: Duration::from_secs(3600),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse("PARE_JOB_WORKERS", d.workers).max(1),
            retention: Duration::from_secs(env_parse(
                "PARE_JOB_RETENTION_SECS",
                d.retention.as_secs(),
            )),
        }
    }
}

/// Mailbox sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages per remote batch request.
    pub fetch_batch_size: usize,
    /// Overlap subtracted from the watermark when building the search window.
    pub watermark_overlap: chrono::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_batch_size: 100,
            watermark_overlap: chrono::Duration::days(1),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fetch_batch_size: env_parse("PARE_SYNC_BATCH_SIZE", d.fetch_batch_size).clamp(1, 100),
            watermark_overlap: d.watermark_overlap,
        }
    }
}

/// Classifier configuration.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// API key for the chat-completions endpoint. `None` disables remote calls.
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    /// Messages selected per backlog round.
    pub batch_size: usize,
    /// Concurrent classifications within a round.
    pub max_workers: usize,
    /// Pacing delay, divided by `max_workers` and applied per completed item.
    pub rate_delay: Duration,
    /// Body characters sent to the classifier.
    pub body_char_limit: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.2,
            batch_size: 25,
            max_workers: 5,
            rate_delay: Duration::from_millis(100),
            body_char_limit: 4000,
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            api_key: env_secret("OPENAI_API_KEY"),
            model: std::env::var("PARE_CLASSIFIER_MODEL").unwrap_or(d.model),
            base_url: std::env::var("PARE_CLASSIFIER_BASE_URL").unwrap_or(d.base_url),
            temperature: d.temperature,
            batch_size: env_parse("PARE_CLASSIFY_BATCH_SIZE", d.batch_size).max(1),
            max_workers: env_parse("PARE_CLASSIFY_WORKERS", d.max_workers).max(1),
            rate_delay: Duration::from_millis(env_parse(
                "PARE_CLASSIFY_RATE_DELAY_MS",
                d.rate_delay.as_millis() as u64,
            )),
            body_char_limit: d.body_char_limit,
        }
    }
}

/// Google OAuth client configuration used for token refresh.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_url: String,
    pub api_base: String,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: SecretString::from(String::new()),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            api_base: "https://gmail.googleapis.com".to_string(),
        }
    }
}

impl GoogleConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            client_id: std::env::var("GOOGLE_CLIENT_ID").unwrap_or(d.client_id),
            client_secret: env_secret("GOOGLE_CLIENT_SECRET").unwrap_or(d.client_secret),
            token_url: d.token_url,
            api_base: std::env::var("PARE_GMAIL_API_BASE").unwrap_or(d.api_base),
        }
    }
}

/// Background tick configuration.
#[derive(Debug, Clone)]
pub struct TickConfig {
    pub interval: Duration,
    /// `max_results` for the sync job each tick enqueues.
    pub sync_max_results: u32,
    /// Upper bound on the unclassified snapshot handed to a classify job.
    pub backlog_cap: usize,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            sync_max_results: 500,
            backlog_cap: 100,
        }
    }
}

impl TickConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            interval: Duration::from_secs(
                env_parse("PARE_TICK_INTERVAL_SECS", d.interval.as_secs()).max(1),
            ),
            sync_max_results: env_parse("PARE_SYNC_MAX_RESULTS", d.sync_max_results),
            backlog_cap: env_parse("PARE_TICK_BACKLOG_CAP", d.backlog_cap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let store = StoreConfig::default();
        assert_eq!(store.busy_retry_attempts, 3);
        assert_eq!(store.busy_backoff, Duration::from_millis(100));

        let classifier = ClassifierConfig::default();
        assert_eq!(classifier.batch_size, 25);
        assert_eq!(classifier.max_workers, 5);
        assert_eq!(classifier.body_char_limit, 4000);
        assert!(classifier.api_key.is_none());

        let tick = TickConfig::default();
        assert_eq!(tick.sync_max_results, 500);
        assert_eq!(tick.backlog_cap, 100);
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // SAFETY: test-only env mutation on a key nothing else reads.
        unsafe { std::env::set_var("PARE_TEST_ENV_PARSE", "not-a-number") };
        assert_eq!(env_parse("PARE_TEST_ENV_PARSE", 7u32), 7);
        unsafe { std::env::set_var("PARE_TEST_ENV_PARSE", " 12 ") };
        assert_eq!(env_parse("PARE_TEST_ENV_PARSE", 7u32), 12);
        unsafe { std::env::remove_var("PARE_TEST_ENV_PARSE") };
    }
}
