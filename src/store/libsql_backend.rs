//! libSQL storage gateway.
//!
//! `StorageGateway` owns the database handle and hands out `StorageSession`s.
//! Each session wraps its own connection, so a worker never shares a
//! connection with another task; the connection closes when the session is
//! dropped, on every exit path.
//!
//! Every mutating call runs inside `BEGIN IMMEDIATE … COMMIT`, rolls back on
//! error, and is retried with linear backoff while SQLite reports the
//! database as locked.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::classify::Category;
use crate::config::StoreConfig;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    Classification, Meeting, NewMessage, StoredCredentials, StoredMessage, SyncStats, Task,
    TaskStatus, UnsubscribeEntry, User,
};

/// SQLite's historical bound on host parameters per statement.
pub const MAX_SQL_PARAMS: usize = 999;

/// Columns selected for `StoredMessage` rows, in `row_to_message` order.
const MESSAGE_COLUMNS: &str = "id, user_id, external_id, sender, subject, received_at, body, \
                               snippet, raw_json, hidden, created_at";

/// Bounded retry for writes that hit a locked database.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Attempt `n` waits `n * backoff` before retrying.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Shared handle to the database file. Cheap to clone.
#[derive(Clone)]
pub struct StorageGateway {
    db: Arc<LibSqlDatabase>,
    retry: RetryPolicy,
    busy_timeout: Duration,
}

impl StorageGateway {
    /// Open (or create) the database file, switch it to WAL and run migrations.
    pub async fn open(config: &StoreConfig) -> Result<Self, DatabaseError> {
        let path = config.db_path.as_path();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let gateway = Self {
            db: Arc::new(db),
            retry: RetryPolicy {
                attempts: config.busy_retry_attempts.max(1),
                backoff: config.busy_backoff,
            },
            busy_timeout: config.busy_timeout,
        };

        let session = gateway.session().await?;
        pragma(&session.conn, "PRAGMA journal_mode = WAL")
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;
        migrations::run_migrations(&session.conn).await?;

        info!(path = %path.display(), "Database opened");
        Ok(gateway)
    }

    /// Acquire a session with its own connection.
    pub async fn session(&self) -> Result<StorageSession, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        pragma(
            &conn,
            &format!("PRAGMA busy_timeout = {}", self.busy_timeout.as_millis()),
        )
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;

        Ok(StorageSession {
            conn,
            retry: self.retry,
        })
    }
}

/// A scoped storage handle. Dropping it releases the connection.
pub struct StorageSession {
    conn: Connection,
    retry: RetryPolicy,
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding. Fixed-width so text order is time order.
fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_ts() -> String {
    format_ts(&Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ndt.and_utc());
    }
    None
}

/// Run a PRAGMA that reports its value as a row; stepping the row applies it.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), libsql::Error> {
    let mut rows = conn.query(sql, ()).await?;
    let _ = rows.next().await?;
    Ok(())
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Whether SQLite reported the database as locked or busy.
fn is_busy(e: &libsql::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("database is locked")
        || msg.contains("database is busy")
        || msg.contains("database table is locked")
        || msg.contains("sqlite_busy")
}

/// Map a libsql Row to a StoredMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let received: Option<String> = row.get(5).ok();
    let created: String = row.get(10)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        external_id: row.get(2)?,
        sender: row.get(3).ok(),
        subject: row.get(4).ok(),
        received_at: received.as_deref().and_then(parse_datetime),
        body: row.get(6).ok(),
        snippet: row.get(7).ok(),
        raw_json: row.get(8).ok(),
        hidden: row.get::<i64>(9)? != 0,
        created_at: parse_datetime(&created).unwrap_or(DateTime::<Utc>::MIN_UTC),
    })
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

impl StorageSession {
    /// Run `body` in a write transaction, retrying while the database is busy.
    ///
    /// `body` is re-invoked from scratch on each attempt.
    async fn write<T, F, Fut>(&self, op: &'static str, mut body: F) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, libsql::Error>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1u32;
        loop {
            let outcome = match self.conn.execute("BEGIN IMMEDIATE", ()).await {
                Ok(_) => match body().await {
                    Ok(value) => self.conn.execute("COMMIT", ()).await.map(|_| value),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if let Err(rollback_err) = self.conn.execute("ROLLBACK", ()).await {
                debug!(op, error = %rollback_err, "Rollback skipped");
            }

            if !is_busy(&err) {
                return Err(DatabaseError::Query(format!("{op}: {err}")));
            }
            if attempt >= attempts {
                return Err(DatabaseError::Busy {
                    attempts,
                    reason: format!("{op}: {err}"),
                });
            }

            let delay = self.retry.backoff * attempt;
            warn!(op, attempt, delay_ms = delay.as_millis() as u64, "Database busy, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    // ── Users & credentials ────────────────────────────────────────

    /// Insert the user if unknown; returns the user id either way.
    pub async fn upsert_user(&self, email: &str) -> Result<i64, DatabaseError> {
        let conn = &self.conn;
        let now = now_ts();
        let now = now.as_str();
        let id = self
            .write("upsert_user", || async move {
                conn.execute(
                    "INSERT INTO users (email, created_at) VALUES (?1, ?2)
                     ON CONFLICT(email) DO NOTHING",
                    params![email, now],
                )
                .await?;
                let mut rows = conn
                    .query("SELECT id FROM users WHERE email = ?1", params![email])
                    .await?;
                match rows.next().await? {
                    Some(row) => Ok(Some(row.get::<i64>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        id.ok_or_else(|| DatabaseError::NotFound {
            entity: "user".into(),
            id: email.to_string(),
        })
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn
            .query("SELECT id, email FROM users WHERE id = ?1", params![user_id])
            .await
            .map_err(query_err("get_user"))?;
        match rows.next().await.map_err(query_err("get_user"))? {
            Some(row) => Ok(Some(User {
                id: row.get(0).map_err(query_err("get_user"))?,
                email: row.get(1).map_err(query_err("get_user"))?,
            })),
            None => Ok(None),
        }
    }

    /// Users that have stored credentials, i.e. can be synced.
    pub async fn list_users_with_credentials(&self) -> Result<Vec<User>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT u.id, u.email FROM users u
                 JOIN credentials c ON c.user_id = u.id
                 ORDER BY u.id",
                (),
            )
            .await
            .map_err(query_err("list_users_with_credentials"))?;

        let mut users = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            users.push(User {
                id: row.get(0).map_err(query_err("list_users_with_credentials"))?,
                email: row.get(1).map_err(query_err("list_users_with_credentials"))?,
            });
        }
        Ok(users)
    }

    /// Store tokens. A missing refresh token keeps the previously stored one.
    pub async fn upsert_credentials(
        &self,
        user_id: i64,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let conn = &self.conn;
        let now = now_ts();
        let now = now.as_str();
        let expiry = token_expiry.as_ref().map(format_ts);
        let expiry = expiry.as_deref();
        self.write("upsert_credentials", || async move {
            conn.execute(
                "INSERT INTO credentials (user_id, access_token, refresh_token, token_expiry, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = COALESCE(excluded.refresh_token, credentials.refresh_token),
                    token_expiry = excluded.token_expiry,
                    updated_at = excluded.updated_at",
                params![
                    user_id,
                    access_token,
                    opt_text(refresh_token),
                    opt_text(expiry),
                    now
                ],
            )
            .await?;
            Ok(())
        })
        .await?;
        debug!(user_id, "Credentials stored");
        Ok(())
    }

    pub async fn get_credentials(
        &self,
        user_id: i64,
    ) -> Result<Option<StoredCredentials>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT access_token, refresh_token, token_expiry FROM credentials WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(query_err("get_credentials"))?;
        match rows.next().await.map_err(query_err("get_credentials"))? {
            Some(row) => {
                let expiry: Option<String> = row.get(2).ok();
                Ok(Some(StoredCredentials {
                    user_id,
                    access_token: row.get(0).ok(),
                    refresh_token: row.get(1).ok(),
                    token_expiry: expiry.as_deref().and_then(parse_datetime),
                }))
            }
            None => Ok(None),
        }
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Insert or update a message by `(user_id, external_id)`.
    ///
    /// On conflict every content column is replaced; `hidden` is never touched.
    pub async fn upsert_message(&self, msg: &NewMessage) -> Result<i64, DatabaseError> {
        let conn = &self.conn;
        let now = now_ts();
        let now = now.as_str();
        let received = msg.received_at.as_ref().map(format_ts);
        let received = received.as_deref();
        let id = self
            .write("upsert_message", || async move {
                let mut rows = conn
                    .query(
                        "INSERT INTO messages (user_id, external_id, sender, subject, received_at,
                            body, snippet, raw_json, hidden, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)
                         ON CONFLICT(user_id, external_id) DO UPDATE SET
                            sender = excluded.sender,
                            subject = excluded.subject,
                            received_at = excluded.received_at,
                            body = excluded.body,
                            snippet = excluded.snippet,
                            raw_json = excluded.raw_json,
                            updated_at = excluded.updated_at
                         RETURNING id",
                        params![
                            msg.user_id,
                            msg.external_id.as_str(),
                            opt_text(msg.sender.as_deref()),
                            opt_text(msg.subject.as_deref()),
                            opt_text(received),
                            opt_text(msg.body.as_deref()),
                            opt_text(msg.snippet.as_deref()),
                            opt_text(msg.raw_json.as_deref()),
                            now
                        ],
                    )
                    .await?;
                match rows.next().await? {
                    Some(row) => Ok(Some(row.get::<i64>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;

        let id = id.ok_or_else(|| {
            DatabaseError::Query(format!("upsert_message: no id for {}", msg.external_id))
        })?;
        debug!(id, external_id = %msg.external_id, "Message upserted");
        Ok(id)
    }

    /// Return the subset of `candidates` already stored for the user.
    ///
    /// Queries in chunks so no statement exceeds `MAX_SQL_PARAMS`; memory is
    /// bounded by the candidate list, never by mailbox size.
    pub async fn existing_external_ids(
        &self,
        user_id: i64,
        candidates: &[String],
    ) -> Result<HashSet<String>, DatabaseError> {
        let mut existing = HashSet::new();
        for chunk in candidates.chunks(MAX_SQL_PARAMS - 1) {
            let placeholders = (0..chunk.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT external_id FROM messages WHERE user_id = ?1 AND external_id IN ({placeholders})"
            );

            let mut values: Vec<libsql::Value> = Vec::with_capacity(chunk.len() + 1);
            values.push(libsql::Value::Integer(user_id));
            values.extend(chunk.iter().map(|id| libsql::Value::Text(id.clone())));

            let mut rows = self
                .conn
                .query(&sql, values)
                .await
                .map_err(query_err("existing_external_ids"))?;
            while let Ok(Some(row)) = rows.next().await {
                existing.insert(
                    row.get::<String>(0)
                        .map_err(query_err("existing_external_ids"))?,
                );
            }
        }
        Ok(existing)
    }

    /// Most recent message timestamp for the user (the sync watermark).
    pub async fn latest_received_at(
        &self,
        user_id: i64,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT MAX(received_at) FROM messages WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(query_err("latest_received_at"))?;
        match rows.next().await.map_err(query_err("latest_received_at"))? {
            Some(row) => {
                let latest: Option<String> = row.get(0).ok();
                Ok(latest.as_deref().and_then(parse_datetime))
            }
            None => Ok(None),
        }
    }

    /// Visible messages without any classification row, newest first.
    pub async fn unclassified_messages(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             WHERE m.user_id = ?1
               AND m.hidden = 0
               AND NOT EXISTS (SELECT 1 FROM classifications c WHERE c.message_id = m.id)
             ORDER BY m.received_at DESC NULLS LAST, m.created_at DESC
             LIMIT ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![user_id, limit as i64])
            .await
            .map_err(query_err("unclassified_messages"))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(row_to_message(&row).map_err(query_err("unclassified_messages"))?);
        }
        Ok(messages)
    }

    /// Fetch one message, scoped to its owner.
    pub async fn get_message(
        &self,
        user_id: i64,
        message_id: i64,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND user_id = ?2"),
                params![message_id, user_id],
            )
            .await
            .map_err(query_err("get_message"))?;
        match rows.next().await.map_err(query_err("get_message"))? {
            Some(row) => Ok(Some(row_to_message(&row).map_err(query_err("get_message"))?)),
            None => Ok(None),
        }
    }

    /// Set the user-controlled hidden flag. Returns false if no such message.
    pub async fn hide_message(&self, user_id: i64, message_id: i64) -> Result<bool, DatabaseError> {
        let conn = &self.conn;
        let updated = self
            .write("hide_message", || async move {
                conn.execute(
                    "UPDATE messages SET hidden = 1 WHERE id = ?1 AND user_id = ?2",
                    params![message_id, user_id],
                )
                .await
            })
            .await?;
        Ok(updated > 0)
    }

    pub async fn sync_stats(&self, user_id: i64) -> Result<SyncStats, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN EXISTS (
                        SELECT 1 FROM classifications c WHERE c.message_id = m.id
                    ) THEN 1 ELSE 0 END), 0)
                 FROM messages m WHERE m.user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(query_err("sync_stats"))?;
        match rows.next().await.map_err(query_err("sync_stats"))? {
            Some(row) => {
                let total: i64 = row.get(0).map_err(query_err("sync_stats"))?;
                let classified: i64 = row.get(1).map_err(query_err("sync_stats"))?;
                Ok(SyncStats {
                    total,
                    classified,
                    unclassified: total - classified,
                })
            }
            None => Ok(SyncStats::default()),
        }
    }

    // ── Classifications ────────────────────────────────────────────

    /// Upsert by `(message_id, category)`; only a repeat of the same category
    /// updates in place.
    pub async fn upsert_classification(
        &self,
        message_id: i64,
        category: Category,
        confidence: f64,
    ) -> Result<(), DatabaseError> {
        let conn = &self.conn;
        let now = now_ts();
        let now = now.as_str();
        let confidence = confidence.clamp(0.0, 1.0);
        self.write("upsert_classification", || async move {
            conn.execute(
                "INSERT INTO classifications (message_id, category, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(message_id, category) DO UPDATE SET confidence = excluded.confidence",
                params![message_id, category.as_str(), confidence, now],
            )
            .await?;
            Ok(())
        })
        .await?;
        debug!(message_id, category = %category, confidence, "Classification stored");
        Ok(())
    }

    pub async fn classifications_for(
        &self,
        message_id: i64,
    ) -> Result<Vec<Classification>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT category, confidence, created_at FROM classifications
                 WHERE message_id = ?1 ORDER BY id",
                params![message_id],
            )
            .await
            .map_err(query_err("classifications_for"))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let category: String = row.get(0).map_err(query_err("classifications_for"))?;
            let created: String = row.get(2).map_err(query_err("classifications_for"))?;
            out.push(Classification {
                message_id,
                category: Category::coerce(&category),
                confidence: row.get(1).map_err(query_err("classifications_for"))?,
                created_at: parse_datetime(&created).unwrap_or(DateTime::<Utc>::MIN_UTC),
            });
        }
        Ok(out)
    }

    // ── Projections ────────────────────────────────────────────────

    pub async fn upsert_meeting(&self, meeting: &Meeting) -> Result<(), DatabaseError> {
        let conn = &self.conn;
        let now = now_ts();
        let now = now.as_str();
        let attendees = serde_json::json!({ "attendees": meeting.attendees }).to_string();
        let attendees = attendees.as_str();
        self.write("upsert_meeting", || async move {
            conn.execute(
                "INSERT INTO meetings (message_id, title, start_time, end_time, location,
                    attendees_json, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(message_id) DO UPDATE SET
                    title = excluded.title,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    location = excluded.location,
                    attendees_json = excluded.attendees_json,
                    confidence = excluded.confidence",
                params![
                    meeting.message_id,
                    opt_text(meeting.title.as_deref()),
                    opt_text(meeting.start_time.as_deref()),
                    opt_text(meeting.end_time.as_deref()),
                    opt_text(meeting.location.as_deref()),
                    attendees,
                    meeting.confidence,
                    now
                ],
            )
            .await?;
            Ok(())
        })
        .await?;
        debug!(message_id = meeting.message_id, "Meeting stored");
        Ok(())
    }

    pub async fn get_meeting(&self, message_id: i64) -> Result<Option<Meeting>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT title, start_time, end_time, location, attendees_json, confidence
                 FROM meetings WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(query_err("get_meeting"))?;
        let Some(row) = rows.next().await.map_err(query_err("get_meeting"))? else {
            return Ok(None);
        };

        let attendees_json: Option<String> = row.get(4).ok();
        let attendees = attendees_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
            .and_then(|v| {
                v.get("attendees").and_then(|a| a.as_array()).map(|a| {
                    a.iter()
                        .filter_map(|x| x.as_str().map(str::to_string))
                        .collect()
                })
            })
            .unwrap_or_default();

        Ok(Some(Meeting {
            message_id,
            title: row.get(0).ok(),
            start_time: row.get(1).ok(),
            end_time: row.get(2).ok(),
            location: row.get(3).ok(),
            attendees,
            confidence: row.get(5).map_err(query_err("get_meeting"))?,
        }))
    }

    /// Insert or update a task. An existing row keeps its status.
    pub async fn upsert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let conn = &self.conn;
        let now = now_ts();
        let now = now.as_str();
        self.write("upsert_task", || async move {
            conn.execute(
                "INSERT INTO tasks (message_id, description, due_date, status, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(message_id) DO UPDATE SET
                    description = excluded.description,
                    due_date = excluded.due_date,
                    confidence = excluded.confidence",
                params![
                    task.message_id,
                    opt_text(task.description.as_deref()),
                    opt_text(task.due_date.as_deref()),
                    task.status.as_str(),
                    task.confidence,
                    now
                ],
            )
            .await?;
            Ok(())
        })
        .await?;
        debug!(message_id = task.message_id, "Task stored");
        Ok(())
    }

    pub async fn get_task(&self, message_id: i64) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT description, due_date, status, confidence FROM tasks WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(query_err("get_task"))?;
        match rows.next().await.map_err(query_err("get_task"))? {
            Some(row) => {
                let status: String = row.get(2).map_err(query_err("get_task"))?;
                Ok(Some(Task {
                    message_id,
                    description: row.get(0).ok(),
                    due_date: row.get(1).ok(),
                    status: TaskStatus::parse(&status),
                    confidence: row.get(3).map_err(query_err("get_task"))?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Mark a task completed. Returns false if the message has no task.
    pub async fn complete_task(&self, message_id: i64) -> Result<bool, DatabaseError> {
        let conn = &self.conn;
        let updated = self
            .write("complete_task", || async move {
                conn.execute(
                    "UPDATE tasks SET status = ?2 WHERE message_id = ?1",
                    params![message_id, TaskStatus::Completed.as_str()],
                )
                .await
            })
            .await?;
        Ok(updated > 0)
    }

    pub async fn has_unsubscribe(&self, message_id: i64) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM unsubscribe_entries WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(query_err("has_unsubscribe"))?;
        Ok(rows
            .next()
            .await
            .map_err(query_err("has_unsubscribe"))?
            .is_some())
    }

    /// Create a pending unsubscribe entry unless one exists. Returns true if created.
    pub async fn create_unsubscribe_if_absent(
        &self,
        message_id: i64,
        url: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = &self.conn;
        let now = now_ts();
        let now = now.as_str();
        let inserted = self
            .write("create_unsubscribe_if_absent", || async move {
                conn.execute(
                    "INSERT INTO unsubscribe_entries (message_id, url, status, created_at)
                     VALUES (?1, ?2, 'pending', ?3)
                     ON CONFLICT(message_id) DO NOTHING",
                    params![message_id, url, now],
                )
                .await
            })
            .await?;
        if inserted > 0 {
            debug!(message_id, url, "Unsubscribe entry created");
        }
        Ok(inserted > 0)
    }

    pub async fn get_unsubscribe(
        &self,
        message_id: i64,
    ) -> Result<Option<UnsubscribeEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT url, status FROM unsubscribe_entries WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(query_err("get_unsubscribe"))?;
        match rows.next().await.map_err(query_err("get_unsubscribe"))? {
            Some(row) => Ok(Some(UnsubscribeEntry {
                message_id,
                url: row.get(0).map_err(query_err("get_unsubscribe"))?,
                status: row.get(1).map_err(query_err("get_unsubscribe"))?,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A gateway over a file in a fresh temp dir. Keep the dir alive.
    pub(crate) async fn test_gateway() -> (tempfile::TempDir, StorageGateway) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("pare.db"),
            ..StoreConfig::default()
        };
        let gateway = StorageGateway::open(&config).await.unwrap();
        (dir, gateway)
    }

    fn new_message(user_id: i64, external_id: &str, subject: &str) -> NewMessage {
        NewMessage {
            user_id,
            external_id: external_id.to_string(),
            sender: Some("alice@example.com".into()),
            subject: Some(subject.to_string()),
            received_at: Some(Utc::now()),
            body: Some("hello".into()),
            snippet: Some("hello".into()),
            raw_json: None,
        }
    }

    #[tokio::test]
    async fn upsert_user_is_idempotent() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let a = s.upsert_user("a@example.com").await.unwrap();
        let b = s.upsert_user("a@example.com").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(s.get_user(a).await.unwrap().unwrap().email, "a@example.com");
    }

    #[tokio::test]
    async fn upsert_preserves_hidden_flag() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let user = s.upsert_user("a@example.com").await.unwrap();

        let id = s.upsert_message(&new_message(user, "ext-1", "First")).await.unwrap();
        assert!(s.hide_message(user, id).await.unwrap());

        let again = s
            .upsert_message(&new_message(user, "ext-1", "Changed subject"))
            .await
            .unwrap();
        assert_eq!(again, id);

        let stored = s.get_message(user, id).await.unwrap().unwrap();
        assert_eq!(stored.subject.as_deref(), Some("Changed subject"));
        assert!(stored.hidden);
    }

    #[tokio::test]
    async fn existing_ids_across_chunks() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let user = s.upsert_user("a@example.com").await.unwrap();
        let other = s.upsert_user("b@example.com").await.unwrap();

        s.upsert_message(&new_message(user, "known-1", "x")).await.unwrap();
        s.upsert_message(&new_message(user, "known-2", "y")).await.unwrap();
        s.upsert_message(&new_message(other, "foreign", "z")).await.unwrap();

        // Enough candidates to force three chunks.
        let mut candidates: Vec<String> = (0..2500).map(|i| format!("new-{i}")).collect();
        candidates.insert(10, "known-1".into());
        candidates.push("known-2".into());
        candidates.push("foreign".into());

        let existing = s.existing_external_ids(user, &candidates).await.unwrap();
        assert_eq!(existing.len(), 2);
        assert!(existing.contains("known-1"));
        assert!(existing.contains("known-2"));
    }

    #[tokio::test]
    async fn watermark_is_latest_received() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let user = s.upsert_user("a@example.com").await.unwrap();
        assert!(s.latest_received_at(user).await.unwrap().is_none());

        let older = DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z").unwrap().with_timezone(&Utc);
        let newer = DateTime::parse_from_rfc3339("2024-03-05T08:30:00.250Z").unwrap().with_timezone(&Utc);
        let mut m = new_message(user, "a", "a");
        m.received_at = Some(newer);
        s.upsert_message(&m).await.unwrap();
        let mut m = new_message(user, "b", "b");
        m.received_at = Some(older);
        s.upsert_message(&m).await.unwrap();

        assert_eq!(s.latest_received_at(user).await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn unclassified_excludes_hidden_and_classified() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let user = s.upsert_user("a@example.com").await.unwrap();

        let mut undated = new_message(user, "undated", "u");
        undated.received_at = None;
        let undated = s.upsert_message(&undated).await.unwrap();

        let mut old = new_message(user, "old", "o");
        old.received_at = Some(Utc::now() - chrono::Duration::days(3));
        let old = s.upsert_message(&old).await.unwrap();

        let recent = s.upsert_message(&new_message(user, "recent", "r")).await.unwrap();
        let hidden = s.upsert_message(&new_message(user, "hidden", "h")).await.unwrap();
        s.hide_message(user, hidden).await.unwrap();
        let done = s.upsert_message(&new_message(user, "done", "d")).await.unwrap();
        s.upsert_classification(done, Category::Junk, 0.9).await.unwrap();

        let ids: Vec<i64> = s
            .unclassified_messages(user, 10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![recent, old, undated]);

        assert_eq!(s.unclassified_messages(user, 1).await.unwrap().len(), 1);

        let stats = s.sync_stats(user).await.unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.classified, 1);
        assert_eq!(stats.unclassified, 4);
    }

    #[tokio::test]
    async fn classification_keyed_by_message_and_category() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let user = s.upsert_user("a@example.com").await.unwrap();
        let id = s.upsert_message(&new_message(user, "m", "m")).await.unwrap();

        s.upsert_classification(id, Category::Task, 0.4).await.unwrap();
        s.upsert_classification(id, Category::Task, 0.8).await.unwrap();
        let rows = s.classifications_for(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].confidence - 0.8).abs() < 1e-9);

        // A different category adds a second row.
        s.upsert_classification(id, Category::Meeting, 0.7).await.unwrap();
        assert_eq!(s.classifications_for(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn task_status_survives_update() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let user = s.upsert_user("a@example.com").await.unwrap();
        let id = s.upsert_message(&new_message(user, "m", "m")).await.unwrap();

        let mut task = Task {
            message_id: id,
            description: Some("File report".into()),
            due_date: None,
            status: TaskStatus::Pending,
            confidence: 0.6,
        };
        s.upsert_task(&task).await.unwrap();
        assert!(s.complete_task(id).await.unwrap());

        task.description = Some("File the quarterly report".into());
        task.confidence = 0.9;
        s.upsert_task(&task).await.unwrap();

        let stored = s.get_task(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.description.as_deref(), Some("File the quarterly report"));
        assert!((stored.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn meeting_upsert_replaces_in_place() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let user = s.upsert_user("a@example.com").await.unwrap();
        let id = s.upsert_message(&new_message(user, "m", "m")).await.unwrap();

        let mut meeting = Meeting {
            message_id: id,
            title: Some("Sync".into()),
            start_time: Some("2024-01-02T18:00:00".into()),
            end_time: Some("2024-01-02T19:00:00".into()),
            location: None,
            attendees: vec!["bob@example.com".into()],
            confidence: 0.7,
        };
        s.upsert_meeting(&meeting).await.unwrap();
        meeting.location = Some("Room 4".into());
        s.upsert_meeting(&meeting).await.unwrap();

        assert_eq!(s.get_meeting(id).await.unwrap().unwrap(), meeting);
    }

    #[tokio::test]
    async fn unsubscribe_created_once() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let user = s.upsert_user("a@example.com").await.unwrap();
        let id = s.upsert_message(&new_message(user, "m", "m")).await.unwrap();

        assert!(!s.has_unsubscribe(id).await.unwrap());
        assert!(s.create_unsubscribe_if_absent(id, "https://a.example/u").await.unwrap());
        assert!(!s.create_unsubscribe_if_absent(id, "https://b.example/u").await.unwrap());

        let entry = s.get_unsubscribe(id).await.unwrap().unwrap();
        assert_eq!(entry.url, "https://a.example/u");
        assert_eq!(entry.status, "pending");
    }

    #[tokio::test]
    async fn credentials_keep_refresh_token() {
        let (_dir, gw) = test_gateway().await;
        let s = gw.session().await.unwrap();
        let user = s.upsert_user("a@example.com").await.unwrap();

        s.upsert_credentials(user, "access-1", Some("refresh-1"), None).await.unwrap();
        s.upsert_credentials(user, "access-2", None, Some(Utc::now())).await.unwrap();

        let creds = s.get_credentials(user).await.unwrap().unwrap();
        assert_eq!(creds.access_token.as_deref(), Some("access-2"));
        assert_eq!(creds.refresh_token.as_deref(), Some("refresh-1"));
        assert!(creds.token_expiry.is_some());

        let users = s.list_users_with_credentials().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, user);
    }

    #[tokio::test]
    async fn sessions_see_each_others_writes() {
        let (_dir, gw) = test_gateway().await;
        let writer = gw.session().await.unwrap();
        let user = writer.upsert_user("a@example.com").await.unwrap();
        writer.upsert_message(&new_message(user, "shared", "s")).await.unwrap();
        drop(writer);

        let reader = gw.session().await.unwrap();
        let existing = reader
            .existing_external_ids(user, &["shared".to_string()])
            .await
            .unwrap();
        assert!(existing.contains("shared"));
    }

    #[tokio::test]
    async fn write_retries_then_surfaces_busy() {
        let (_dir, gw) = test_gateway().await;
        let holder = gw.session().await.unwrap();
        holder.conn.execute("BEGIN IMMEDIATE", ()).await.unwrap();

        let mut session = gw.session().await.unwrap();
        session.retry = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(5),
        };
        pragma(&session.conn, "PRAGMA busy_timeout = 0").await.unwrap();

        let err = session.upsert_user("c@example.com").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Busy { attempts: 2, .. }), "{err}");

        holder.conn.execute("ROLLBACK", ()).await.unwrap();
        assert!(session.upsert_user("c@example.com").await.is_ok());
    }
}
