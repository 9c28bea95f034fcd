//! SQLite repository.
//!
//! The store is deliberately passive: it validates nothing beyond shape and
//! enforces no workflow. The gateway is its only writer; reads go through the
//! same pool concurrently. Timestamps are RFC 3339 TEXT, ids are TEXT, and
//! the event log is append-only with a `(run_id, seq)` index for replay.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::config::PolicyConfig;
use crate::types::{
    AgentRun, Channel, ChannelKind, ChannelStatus, Chat, ChatMessage, Direction, Event, EventKind,
    RunError, RunErrorKind, RunStatus,
};

/// Hard cap on any message-listing query.
const MAX_MESSAGE_LIMIT: u32 = 500;

/// Repository errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A row held a value that no longer parses.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the SQLite repository. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be opened or migrated.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database (tests and ephemeral runs).
    ///
    /// The pool is pinned to one connection; SQLite gives every connection
    /// its own private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the connection cannot be established.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS channels (
                channel_id TEXT PRIMARY KEY,
                kind       TEXT NOT NULL,
                status     TEXT NOT NULL,
                last_seen  TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chats (
                chat_id    TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                title      TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                chat_id    TEXT NOT NULL,
                direction  TEXT NOT NULL,
                sender_id  TEXT NOT NULL,
                text       TEXT NOT NULL,
                ts         TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_runs (
                run_id        TEXT PRIMARY KEY,
                chat_id       TEXT NOT NULL,
                channel_id    TEXT NOT NULL,
                requested_by  TEXT NOT NULL,
                status        TEXT NOT NULL,
                step          INTEGER NOT NULL,
                max_steps     INTEGER NOT NULL,
                deadline      TEXT NOT NULL,
                output_text   TEXT,
                error_kind    TEXT,
                error_message TEXT,
                created_at    TEXT NOT NULL,
                ended_at      TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                seq        INTEGER PRIMARY KEY,
                kind       TEXT NOT NULL,
                ts         TEXT NOT NULL,
                run_id     TEXT,
                channel_id TEXT,
                payload    TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_run_seq ON events(run_id, seq)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Liveness probe for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the pool cannot serve a trivial query.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -- channels ----------------------------------------------------------

    /// Insert or refresh a channel row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            "INSERT INTO channels (channel_id, kind, status, last_seen)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(channel_id) DO UPDATE SET kind=?2, status=?3, last_seen=?4",
        )
        .bind(&channel.channel_id)
        .bind(channel.kind.as_str())
        .bind(channel.status.as_str())
        .bind(channel.last_seen.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update a channel's status. Returns `false` if the channel is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn set_channel_status(
        &self,
        channel_id: &str,
        status: ChannelStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE channels SET status=?1, last_seen=?2 WHERE channel_id=?3",
        )
        .bind(status.as_str())
        .bind(last_seen.to_rfc3339())
        .bind(channel_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Load a channel by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let row: Option<(String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT channel_id, kind, status, last_seen FROM channels WHERE channel_id=?1",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(channel_from_row).transpose()
    }

    /// All channels, id-ordered.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT channel_id, kind, status, last_seen FROM channels ORDER BY channel_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(channel_from_row).collect()
    }

    // -- chats and messages ------------------------------------------------

    /// Create a chat if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn ensure_chat(&self, chat_id: &str, channel_id: &str, title: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO chats (chat_id, channel_id, title, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(chat_id)
        .bind(channel_id)
        .bind(title)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Chats, optionally restricted to a channel, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn list_chats(&self, channel_id: Option<&str>) -> Result<Vec<Chat>> {
        let rows: Vec<(String, String, String, String)> = match channel_id {
            Some(channel) => {
                sqlx::query_as(
                    "SELECT chat_id, channel_id, title, created_at FROM chats
                     WHERE channel_id=?1 ORDER BY created_at DESC",
                )
                .bind(channel)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT chat_id, channel_id, title, created_at FROM chats
                     ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter()
            .map(|(chat_id, channel_id, title, created_at)| {
                Ok(Chat {
                    chat_id,
                    channel_id,
                    title,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    /// Append a message. Messages are immutable once inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (message_id, chat_id, direction, sender_id, text, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&message.message_id)
        .bind(&message.chat_id)
        .bind(message.direction.as_str())
        .bind(&message.sender_id)
        .bind(&message.text)
        .bind(message.ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The newest `limit` messages of a chat, oldest first (newest-last).
    /// `limit` is clamped to 500.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn list_messages(&self, chat_id: &str, limit: u32) -> Result<Vec<ChatMessage>> {
        let limit = limit.min(MAX_MESSAGE_LIMIT).max(1);
        let rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
            "SELECT message_id, chat_id, direction, sender_id, text, ts FROM messages
             WHERE chat_id=?1 ORDER BY rowid DESC LIMIT ?2",
        )
        .bind(chat_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<ChatMessage> = rows
            .into_iter()
            .map(message_from_row)
            .collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    // -- runs ---------------------------------------------------------------

    /// Persist a freshly created run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn insert_run(&self, run: &AgentRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_runs
             (run_id, chat_id, channel_id, requested_by, status, step, max_steps,
              deadline, output_text, error_kind, error_message, created_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(run.run_id.to_string())
        .bind(&run.chat_id)
        .bind(&run.channel_id)
        .bind(&run.requested_by)
        .bind(run.status.as_str())
        .bind(i64::from(run.step))
        .bind(i64::from(run.max_steps))
        .bind(run.deadline.to_rfc3339())
        .bind(run.output_text.as_deref())
        .bind(run.error.as_ref().map(|e| e.kind.as_str()))
        .bind(run.error.as_ref().map(|e| e.message.as_str()))
        .bind(run.created_at.to_rfc3339())
        .bind(run.ended_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a non-terminal status/step change.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn update_run_progress(
        &self,
        run_id: Uuid,
        status: RunStatus,
        step: u32,
    ) -> Result<()> {
        sqlx::query("UPDATE agent_runs SET status=?1, step=?2 WHERE run_id=?3")
            .bind(status.as_str())
            .bind(i64::from(step))
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a terminal transition; `ended_at` is always set here and only
    /// here.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output_text: Option<&str>,
        error: Option<&RunError>,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agent_runs
             SET status=?1, output_text=?2, error_kind=?3, error_message=?4, ended_at=?5
             WHERE run_id=?6",
        )
        .bind(status.as_str())
        .bind(output_text)
        .bind(error.map(|e| e.kind.as_str()))
        .bind(error.map(|e| e.message.as_str()))
        .bind(ended_at.to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<AgentRun>> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT run_id, chat_id, channel_id, requested_by, status, step, max_steps,
                    deadline, output_text, error_kind, error_message, created_at, ended_at
             FROM agent_runs WHERE run_id=?1",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(run_from_row).transpose()
    }

    // -- events -------------------------------------------------------------

    /// Append an event to the log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn append_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (seq, kind, ts, run_id, channel_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(i64::try_from(event.seq).unwrap_or(i64::MAX))
        .bind(event.kind.as_str())
        .bind(event.ts.to_rfc3339())
        .bind(event.run_id.map(|id| id.to_string()))
        .bind(event.channel_id.as_deref())
        .bind(event.payload.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All events with `seq > after_seq`, in sequence order, capped at
    /// `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn events_after(&self, after_seq: u64, limit: u32) -> Result<Vec<Event>> {
        let rows: Vec<(i64, String, String, Option<String>, Option<String>, String)> =
            sqlx::query_as(
                "SELECT seq, kind, ts, run_id, channel_id, payload FROM events
                 WHERE seq>?1 ORDER BY seq LIMIT ?2",
            )
            .bind(i64::try_from(after_seq).unwrap_or(i64::MAX))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    /// A run's events with `seq > after_seq`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn events_for_run_after(&self, run_id: Uuid, after_seq: u64) -> Result<Vec<Event>> {
        let rows: Vec<(i64, String, String, Option<String>, Option<String>, String)> =
            sqlx::query_as(
                "SELECT seq, kind, ts, run_id, channel_id, payload FROM events
                 WHERE run_id=?1 AND seq>?2 ORDER BY seq",
            )
            .bind(run_id.to_string())
            .bind(i64::try_from(after_seq).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    // -- config -------------------------------------------------------------

    /// Persist the merged policy so it survives restarts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or unserializable policy.
    pub async fn save_policy(&self, policy: &PolicyConfig) -> Result<()> {
        let value =
            serde_json::to_string(policy).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO config (key, value) VALUES ('policy', ?1)
             ON CONFLICT(key) DO UPDATE SET value=?1",
        )
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load the persisted policy, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn load_policy(&self) -> Result<Option<PolicyConfig>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM config WHERE key='policy'")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((value,)) => serde_json::from_str(&value)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    // -- audit --------------------------------------------------------------

    /// Terminal runs missing `ended_at`; should always be zero.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn count_terminal_without_ended(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM agent_runs
             WHERE status IN ('completed','failed','canceled','timed_out')
             AND ended_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Non-terminal runs created before `cutoff`, likely orphaned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT run_id FROM agent_runs
             WHERE status NOT IN ('completed','failed','canceled','timed_out')
             AND created_at < ?1",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(id,)| Uuid::parse_str(&id).ok())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

type RunRow = (
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
);

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn channel_from_row(row: (String, String, String, Option<String>)) -> Result<Channel> {
    let (channel_id, kind, status, last_seen) = row;
    Ok(Channel {
        channel_id,
        kind: ChannelKind::parse(&kind).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        status: ChannelStatus::parse(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        last_seen: last_seen.as_deref().map(parse_ts).transpose()?,
    })
}

fn message_from_row(
    row: (String, String, String, String, String, String),
) -> Result<ChatMessage> {
    let (message_id, chat_id, direction, sender_id, text, ts) = row;
    Ok(ChatMessage {
        message_id,
        chat_id,
        direction: Direction::parse(&direction).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        sender_id,
        text,
        ts: parse_ts(&ts)?,
    })
}

fn run_from_row(row: RunRow) -> Result<AgentRun> {
    let (
        run_id,
        chat_id,
        channel_id,
        requested_by,
        status,
        step,
        max_steps,
        deadline,
        output_text,
        error_kind,
        error_message,
        created_at,
        ended_at,
    ) = row;

    let error = match error_kind {
        Some(kind) => Some(RunError {
            kind: RunErrorKind::parse(&kind).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            message: error_message.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(AgentRun {
        run_id: Uuid::parse_str(&run_id)
            .map_err(|e| StoreError::Corrupt(format!("bad run id {run_id:?}: {e}")))?,
        chat_id,
        channel_id,
        requested_by,
        status: RunStatus::parse(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        step: u32::try_from(step).unwrap_or(0),
        max_steps: u32::try_from(max_steps).unwrap_or(0),
        deadline: parse_ts(&deadline)?,
        output_text,
        error,
        created_at: parse_ts(&created_at)?,
        ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn event_from_row(
    row: (i64, String, String, Option<String>, Option<String>, String),
) -> Result<Event> {
    let (seq, kind, ts, run_id, channel_id, payload) = row;
    Ok(Event {
        seq: u64::try_from(seq).unwrap_or(0),
        kind: EventKind::parse(&kind).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        ts: parse_ts(&ts)?,
        run_id: run_id
            .map(|id| {
                Uuid::parse_str(&id)
                    .map_err(|e| StoreError::Corrupt(format!("bad run id {id:?}: {e}")))
            })
            .transpose()?,
        channel_id,
        payload: serde_json::from_str(&payload)
            .map_err(|e| StoreError::Corrupt(format!("bad payload: {e}")))?,
    })
}
