//! Persisted agent message bus: channels, direct messages, typed payloads,
//! TTL expiry, and per-agent read cursors.
//!
//! Cursor advancement compares row ids, not timestamps, so messages posted
//! within the same clock tick are still delivered exactly once per agent.

use rusqlite::{OptionalExtension, params_from_iter};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::error::{CoreError, Result};
use super::{Core, now_iso, now_iso_at};

const SIGNAL_TTL_MINUTES: i64 = 60;
const CONTEXT_TTL_MINUTES: i64 = 120;
const DEFAULT_READ_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Data,
    Signal,
    Context,
    Error,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Data => "data",
            MessageKind::Signal => "signal",
            MessageKind::Context => "context",
            MessageKind::Error => "error",
        }
    }

    pub fn from_kind(value: &str) -> Option<Self> {
        match value {
            "data" => Some(MessageKind::Data),
            "signal" => Some(MessageKind::Signal),
            "context" => Some(MessageKind::Context),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub channel: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub kind: MessageKind,
    pub payload: String,
    pub created_at: String,
    pub expires_at: Option<String>,
}

/// Input for [`Core::post_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub kind: MessageKind,
    pub payload: Value,
    /// `Some(0)` means expired on creation: persisted but never visible.
    pub ttl_minutes: Option<i64>,
}

impl NewMessage {
    pub fn new(channel: impl Into<String>, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            sender: sender.into(),
            recipient: None,
            kind: MessageKind::Data,
            payload,
            ttl_minutes: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Advancing cursor owner; also restricts to broadcast-or-addressed rows.
    pub agent_id: Option<String>,
    pub kind: Option<MessageKind>,
    /// Only messages with `created_at` strictly after this timestamp.
    pub since: Option<String>,
    pub limit: Option<usize>,
}

/// Canonical channel name for a direct-message pair, order-independent.
pub(crate) fn dm_channel(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("dm:{}:{}", lo, hi)
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(4)?;
    Ok(Message {
        id: row.get(0)?,
        channel: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        kind: MessageKind::from_kind(&kind).unwrap_or_default(),
        payload: row.get(5)?,
        created_at: row.get(6)?,
        expires_at: row.get(7)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, channel, sender, recipient, type, payload, created_at, expires_at";

impl Core {
    /// Post a message to a channel. Non-string payloads are serialized.
    pub async fn post_message(&self, message: NewMessage) -> Result<i64> {
        if message.channel.trim().is_empty() {
            return Err(CoreError::Invalid("message channel must not be empty".to_string()));
        }
        if message.sender.trim().is_empty() {
            return Err(CoreError::Invalid("message sender must not be empty".to_string()));
        }
        let now = chrono::Utc::now();
        let created_at = now_iso_at(now);
        let expires_at = message
            .ttl_minutes
            .map(|ttl| now_iso_at(now + chrono::Duration::minutes(ttl)));

        let conn = self.inner.swarm_db.lock().await;
        conn.execute(
            "INSERT INTO messages (channel, sender, recipient, type, payload, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                message.channel,
                message.sender,
                message.recipient,
                message.kind.as_str(),
                payload_text(&message.payload),
                created_at,
                expires_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Read a channel in insertion order, honoring expiry, addressing, and
    /// the caller's cursor. A non-empty read advances the cursor to the last
    /// returned message.
    pub async fn read_messages(&self, channel: &str, opts: &ReadOptions) -> Result<Vec<Message>> {
        let now = now_iso();
        let limit = opts.limit.unwrap_or(DEFAULT_READ_LIMIT);

        let conn = self.inner.swarm_db.lock().await;
        let mut sql = format!(
            "SELECT {} FROM messages WHERE channel = ? \
             AND (expires_at IS NULL OR expires_at > ?)",
            MESSAGE_COLUMNS
        );
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(channel.to_string()),
            SqlValue::Text(now.clone()),
        ];

        if let Some(agent_id) = &opts.agent_id {
            sql.push_str(" AND (recipient IS NULL OR recipient = ?)");
            params.push(SqlValue::Text(agent_id.clone()));
            let cursor: Option<i64> = conn
                .query_row(
                    "SELECT last_read_id FROM read_cursors WHERE agent_id = ?1 AND channel = ?2",
                    rusqlite::params![agent_id, channel],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(last_read_id) = cursor {
                sql.push_str(" AND id > ?");
                params.push(SqlValue::Integer(last_read_id));
            }
        }
        if let Some(kind) = opts.kind {
            sql.push_str(" AND type = ?");
            params.push(SqlValue::Text(kind.as_str().to_string()));
        }
        if let Some(since) = &opts.since {
            sql.push_str(" AND created_at > ?");
            params.push(SqlValue::Text(since.clone()));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC LIMIT ?");
        params.push(SqlValue::Integer(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), message_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        drop(stmt);

        if let (Some(agent_id), Some(last)) = (&opts.agent_id, messages.last()) {
            conn.execute(
                "INSERT INTO read_cursors (agent_id, channel, last_read_id, last_read_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(agent_id, channel) DO UPDATE SET \
                 last_read_id = excluded.last_read_id, last_read_at = excluded.last_read_at",
                rusqlite::params![agent_id, channel, last.id, now],
            )?;
        }
        Ok(messages)
    }

    /// Post a direct message on the pair channel `dm:<sorted pair>`.
    pub async fn send_direct(
        &self,
        sender: &str,
        recipient: &str,
        payload: Value,
        kind: MessageKind,
        ttl_minutes: Option<i64>,
    ) -> Result<i64> {
        self.post_message(NewMessage {
            channel: dm_channel(sender, recipient),
            sender: sender.to_string(),
            recipient: Some(recipient.to_string()),
            kind,
            payload,
            ttl_minutes,
        })
        .await
    }

    /// Read direct messages addressed to `agent_id`. With `from_agent`, the
    /// pair channel is read with the agent's cursor; without it, unexpired
    /// messages across all pair channels are returned (no cursor).
    pub async fn read_direct(
        &self,
        agent_id: &str,
        from_agent: Option<&str>,
        opts: &ReadOptions,
    ) -> Result<Vec<Message>> {
        if let Some(from) = from_agent {
            let channel = dm_channel(agent_id, from);
            let opts = ReadOptions {
                agent_id: Some(agent_id.to_string()),
                ..opts.clone()
            };
            return self.read_messages(&channel, &opts).await;
        }

        let now = now_iso();
        let limit = opts.limit.unwrap_or(DEFAULT_READ_LIMIT);
        let conn = self.inner.swarm_db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages \
             WHERE recipient = ?1 AND channel LIKE 'dm:%' \
               AND (expires_at IS NULL OR expires_at > ?2) \
             ORDER BY created_at ASC, id ASC LIMIT ?3",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![agent_id, now, limit as i64],
            message_from_row,
        )?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Broadcast a short-lived signal (`{signal, data}` payload, 60-minute
    /// TTL) to everyone on a channel.
    pub async fn broadcast_signal(
        &self,
        channel: &str,
        sender: &str,
        signal: &str,
        data: Option<Value>,
    ) -> Result<i64> {
        self.post_message(NewMessage {
            channel: channel.to_string(),
            sender: sender.to_string(),
            recipient: None,
            kind: MessageKind::Signal,
            payload: json!({ "signal": signal, "data": data }),
            ttl_minutes: Some(SIGNAL_TTL_MINUTES),
        })
        .await
    }

    /// Publish a keyed context value (120-minute TTL) for later lookup.
    pub async fn share_context(
        &self,
        channel: &str,
        sender: &str,
        key: &str,
        value: Value,
    ) -> Result<i64> {
        self.post_message(NewMessage {
            channel: channel.to_string(),
            sender: sender.to_string(),
            recipient: None,
            kind: MessageKind::Context,
            payload: json!({ "key": key, "value": value }),
            ttl_minutes: Some(CONTEXT_TTL_MINUTES),
        })
        .await
    }

    /// Newest non-expired context value for `key`, or `None`. The key match
    /// is a direct SQL filter, not a scan of channel history.
    pub async fn get_context(&self, channel: &str, key: &str) -> Result<Option<Value>> {
        let now = now_iso();
        let conn = self.inner.swarm_db.lock().await;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM messages \
                 WHERE channel = ?1 AND type = 'context' \
                   AND (expires_at IS NULL OR expires_at > ?2) \
                   AND json_extract(payload, '$.key') = ?3 \
                 ORDER BY id DESC LIMIT 1",
                rusqlite::params![channel, now, key],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(raw) => {
                let parsed: Value = serde_json::from_str(&raw)?;
                Ok(parsed.get("value").cloned())
            }
            None => Ok(None),
        }
    }

    /// Delete every expired message; returns the count removed.
    pub async fn clean_expired(&self) -> Result<usize> {
        let now = now_iso();
        let conn = self.inner.swarm_db.lock().await;
        let deleted = conn.execute(
            "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at < ?1",
            rusqlite::params![now],
        )?;
        if deleted > 0 {
            debug!("cleaned {} expired messages", deleted);
        }
        Ok(deleted)
    }
}
