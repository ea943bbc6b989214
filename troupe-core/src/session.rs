// ABOUTME: Shared state store: conversation sessions, reply fingerprints, de-dup markers
// ABOUTME: SQLite-backed KV with per-key TTL; last-writer-wins, purged lazily on read

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One logical conversation thread. All participants — every agent and the
/// conductor — address the thread by `session_id` for its whole lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub channel_id: String,
    pub initiator_persona: String,
    pub started_at: String,
    /// True when this call created the session rather than rejoining it
    pub is_new: bool,
}

/// Shared store for soft state. Opened by every agent process and the
/// conductor against the same path; keys carry their own expiry and are
/// deleted lazily when a reader finds them stale. Nothing here is precious:
/// a lost session record is re-derived from its channel id on the next
/// event.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Mutex<Connection>>,
}

/// Seconds since the Unix epoch, the expiry clock for every namespace
fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Normalized content fingerprint: lowercased, whitespace-collapsed, capped.
/// Kept human-inspectable rather than hashed so operators can read the store.
fn fingerprint(text: &str) -> String {
    let normalized = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    normalized.chars().take(120).collect()
}

impl StateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create state store directory")?;
            }
        }

        let conn = Connection::open(path).context("Failed to open state store")?;

        // WAL so independently-running agent processes can share the file
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL on state store")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("Failed to set busy timeout on state store")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                channel_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                initiator TEXT NOT NULL,
                started_at TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;

        tracing::info!(path = %path.display(), "State store opened");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Resolve the session for a channel, creating one when none is live.
    ///
    /// Two agents racing this for the same channel may both create a session;
    /// the second insert wins and the orphaned id is harmless (§ accepted
    /// race). The returned record's `is_new` tells the caller whether it
    /// opened the thread.
    pub fn resolve_session(
        &self,
        channel_id: &str,
        initiator_persona: &str,
        ttl_secs: u64,
    ) -> Result<ConversationSession> {
        if let Some(existing) = self.peek_session(channel_id)? {
            return Ok(existing);
        }

        let session = ConversationSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            initiator_persona: initiator_persona.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            is_new: true,
        };
        self.write_session(&session, ttl_secs)?;

        tracing::info!(
            channel_id = %channel_id,
            session_id = %session.session_id,
            initiator = %initiator_persona,
            "Conversation session created"
        );

        Ok(session)
    }

    /// Record a session whose id was assigned elsewhere (the conductor's
    /// `initiate` path). Overwrites any live session for the channel.
    pub fn adopt_session(
        &self,
        channel_id: &str,
        session_id: &str,
        initiator_persona: &str,
        ttl_secs: u64,
    ) -> Result<ConversationSession> {
        let session = ConversationSession {
            session_id: session_id.to_string(),
            channel_id: channel_id.to_string(),
            initiator_persona: initiator_persona.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            is_new: true,
        };
        self.write_session(&session, ttl_secs)?;

        tracing::info!(
            channel_id = %channel_id,
            session_id = %session_id,
            "Adopted externally-assigned session"
        );

        Ok(session)
    }

    /// Look up the live session for a channel without creating one
    pub fn peek_session(&self, channel_id: &str) -> Result<Option<ConversationSession>> {
        let now = now_epoch();
        let db = self.lock()?;

        // Lazy purge of the stale row, if any
        db.execute(
            "DELETE FROM sessions WHERE channel_id = ?1 AND expires_at <= ?2",
            params![channel_id, now],
        )?;

        let mut stmt = db.prepare(
            "SELECT session_id, initiator, started_at FROM sessions
             WHERE channel_id = ?1 AND expires_at > ?2",
        )?;
        let row = stmt.query_row(params![channel_id, now], |row| {
            Ok(ConversationSession {
                session_id: row.get(0)?,
                channel_id: channel_id.to_string(),
                initiator_persona: row.get(1)?,
                started_at: row.get(2)?,
                is_new: false,
            })
        });

        match row {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_session(&self, session: &ConversationSession, ttl_secs: u64) -> Result<()> {
        let expires_at = now_epoch() + ttl_secs as i64;
        let db = self.lock()?;
        db.execute(
            "INSERT OR REPLACE INTO sessions (channel_id, session_id, initiator, started_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &session.channel_id,
                &session.session_id,
                &session.initiator_persona,
                &session.started_at,
                expires_at,
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Event de-duplication markers
    // =========================================================================

    /// Mark an event as seen by this persona. Returns `false` when a live
    /// marker already existed — the caller should skip the event. Best-effort
    /// only: markers expire, and a store failure is reported, not fatal.
    pub fn mark_event_seen(&self, persona: &str, event_id: &str, ttl_secs: u64) -> Result<bool> {
        let key = format!("seen:{}:{}", persona, event_id);
        let already = self.get(&key)?.is_some();
        if !already {
            self.put(&key, "1", ttl_secs)?;
        }
        Ok(!already)
    }

    // =========================================================================
    // Reply fingerprints
    // =========================================================================

    /// Record a fingerprint of a delivered reply so the conductor can steer
    /// personas away from repeating themselves
    pub fn record_reply_fingerprint(
        &self,
        persona: &str,
        channel_id: &str,
        text: &str,
        ttl_secs: u64,
    ) -> Result<()> {
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let key = format!("reply:{}:{}:{}", persona, channel_id, suffix);
        self.put(&key, &fingerprint(text), ttl_secs)
    }

    /// Live fingerprints for a persona in a channel, oldest expiry first
    pub fn recent_reply_fingerprints(
        &self,
        persona: &str,
        channel_id: &str,
    ) -> Result<Vec<String>> {
        let prefix = format!("reply:{}:{}:", persona, channel_id);
        let now = now_epoch();
        let db = self.lock()?;
        // Prefix match via substr rather than LIKE so ids containing LIKE
        // metacharacters ('_', '%') cannot widen the match
        let mut stmt = db.prepare(
            "SELECT value FROM kv
             WHERE substr(key, 1, length(?1)) = ?1 AND expires_at > ?2
             ORDER BY expires_at ASC",
        )?;
        let values = stmt
            .query_map(params![prefix, now], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values)
    }

    // =========================================================================
    // Generic KV
    // =========================================================================

    /// Read a live value, lazily deleting it when expired
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let now = now_epoch();
        let db = self.lock()?;
        db.execute(
            "DELETE FROM kv WHERE key = ?1 AND expires_at <= ?2",
            params![key, now],
        )?;
        let mut stmt = db.prepare("SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2")?;
        let value = stmt.query_row(params![key, now], |row| row.get::<_, String>(0));
        match value {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert a value with its own TTL (last writer wins)
    pub fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let expires_at = now_epoch() + ttl_secs as i64;
        let db = self.lock()?;
        db.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    /// Delete everything past expiry, for periodic housekeeping
    pub fn purge_expired(&self) -> Result<usize> {
        let now = now_epoch();
        let db = self.lock()?;
        let kv = db.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now])?;
        let sessions = db.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])?;
        Ok(kv + sessions)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("State store mutex poisoned: {}", e))
    }
}
