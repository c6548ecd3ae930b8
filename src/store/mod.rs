//! Profile-scoped persistence of chat messages with live views.
//!
//! Backed by a single SQLite database file. Each profile has a stable live
//! view handle: [`MessageStore::load`] returns a `watch::Receiver` over the
//! ordered message list that keeps receiving updates for the lifetime of the
//! store, no matter how many times `load` is re-issued for that or any other
//! profile.

mod schema;

use crate::error::{BrokerError, Result};
use crate::types::{Message, MessageRole, MessageSource, Profile};
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::warn;

/// SQLite-backed message store.
///
/// Thread-safe via an internal `Mutex<Connection>`. All writes are
/// serialized; reads can proceed concurrently with WAL mode on the SQLite
/// side, though we still acquire the mutex for simplicity.
pub struct MessageStore {
    conn: Mutex<Connection>,
    /// One live view channel per profile, created on first `load`.
    views: Mutex<HashMap<String, watch::Sender<Vec<Message>>>>,
    /// Most recently loaded profile id, used for consistency warnings.
    current_profile: Mutex<Option<String>>,
}

impl MessageStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        schema::apply_schema(&conn).map_err(store_err)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory store. History does not survive the process.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        schema::apply_schema(&conn).map_err(store_err)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            views: Mutex::new(HashMap::new()),
            current_profile: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BrokerError::Store("connection lock poisoned".into()))
    }

    /// Read the schema version stamp from the database.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        schema::read_schema_version(&conn).map_err(store_err)
    }

    /// Return a live, continuously-updated view of a profile's messages,
    /// ordered by timestamp ascending.
    ///
    /// The handle is stable per profile: calling `load` again (for this or
    /// another profile) never orphans earlier subscribers.
    pub fn load(&self, profile_id: &str) -> Result<watch::Receiver<Vec<Message>>> {
        let messages = self.static_load(profile_id)?;

        let mut current = self
            .current_profile
            .lock()
            .map_err(|_| BrokerError::Store("profile lock poisoned".into()))?;
        *current = Some(profile_id.to_owned());
        drop(current);

        let mut views = self
            .views
            .lock()
            .map_err(|_| BrokerError::Store("view lock poisoned".into()))?;
        let sender = views
            .entry(profile_id.to_owned())
            .or_insert_with(|| watch::channel(Vec::new()).0);
        sender.send_replace(messages);
        Ok(sender.subscribe())
    }

    /// Return a point-in-time snapshot of a profile's messages, ordered by
    /// timestamp ascending.
    pub fn static_load(&self, profile_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, profile_id, role, body, timestamp, sources \
                 FROM messages WHERE profile_id = ?1 \
                 ORDER BY timestamp ASC, rowid ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![profile_id], row_to_message)
            .map_err(store_err)?;

        let mut messages = Vec::new();
        for r in rows {
            messages.push(r.map_err(store_err)?);
        }
        Ok(messages)
    }

    /// Append and persist a message.
    ///
    /// Warns (non-fatal) if the message's profile id does not match the most
    /// recently loaded profile — a consistency hint, not an enforced
    /// invariant.
    pub fn insert(&self, message: &Message) -> Result<()> {
        if let Ok(current) = self.current_profile.lock() {
            if let Some(ref loaded) = *current {
                if *loaded != message.profile_id {
                    warn!(
                        profile_id = %message.profile_id,
                        loaded = %loaded,
                        "inserting message that does not match the loaded profile"
                    );
                }
            }
        }

        let sources_json = serde_json::to_string(&message.sources)
            .map_err(|e| BrokerError::Store(format!("cannot encode sources: {e}")))?;
        let role = serde_role(message.role);

        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO messages (id, profile_id, role, body, timestamp, sources) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    message.profile_id,
                    role,
                    message.body,
                    message.timestamp,
                    sources_json
                ],
            )
            .map_err(store_err)?;
        }

        self.refresh_view(&message.profile_id)
    }

    /// Update a message in place if one with the same id exists, otherwise
    /// insert it.
    pub fn upsert(&self, message: &Message) -> Result<()> {
        let exists = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT 1 FROM messages WHERE id = ?1")
                .map_err(store_err)?;
            stmt.exists(params![message.id]).map_err(store_err)?
        };

        if !exists {
            return self.insert(message);
        }

        let sources_json = serde_json::to_string(&message.sources)
            .map_err(|e| BrokerError::Store(format!("cannot encode sources: {e}")))?;
        {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE messages SET profile_id = ?2, role = ?3, body = ?4, \
                 timestamp = ?5, sources = ?6 WHERE id = ?1",
                params![
                    message.id,
                    message.profile_id,
                    serde_role(message.role),
                    message.body,
                    message.timestamp,
                    sources_json
                ],
            )
            .map_err(store_err)?;
        }

        self.refresh_view(&message.profile_id)
    }

    /// Remove a message by id, returning whether it existed. Used to
    /// discard a live transcript placeholder that ended up empty.
    pub fn delete(&self, profile_id: &str, id: &str) -> Result<bool> {
        let removed = {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM messages WHERE id = ?1 AND profile_id = ?2",
                params![id, profile_id],
            )
            .map_err(store_err)?
        };
        if removed > 0 {
            self.refresh_view(profile_id)?;
        }
        Ok(removed > 0)
    }

    /// Persist (or update) a conversation profile.
    pub fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO profiles (id, profile_type, age, gender, existing_conditions) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(id) DO UPDATE SET profile_type = ?2, age = ?3, gender = ?4, \
             existing_conditions = ?5",
            params![
                profile.id,
                enum_str(&profile.profile_type)?,
                profile.age,
                enum_str(&profile.gender)?,
                profile.existing_conditions
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Fetch a profile by id. Returns `None` if it was never persisted.
    pub fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, profile_type, age, gender, existing_conditions \
                 FROM profiles WHERE id = ?1",
            )
            .map_err(store_err)?;
        let mut rows = stmt.query(params![id]).map_err(store_err)?;
        match rows.next().map_err(store_err)? {
            Some(row) => Ok(Some(row_to_profile(row).map_err(store_err)?)),
            None => Ok(None),
        }
    }

    /// Re-publish a profile's live view after a write, if one exists.
    fn refresh_view(&self, profile_id: &str) -> Result<()> {
        let has_view = {
            let views = self
                .views
                .lock()
                .map_err(|_| BrokerError::Store("view lock poisoned".into()))?;
            views.contains_key(profile_id)
        };
        if !has_view {
            return Ok(());
        }

        let messages = self.static_load(profile_id)?;
        let views = self
            .views
            .lock()
            .map_err(|_| BrokerError::Store("view lock poisoned".into()))?;
        if let Some(sender) = views.get(profile_id) {
            sender.send_replace(messages);
        }
        Ok(())
    }
}

fn store_err(e: rusqlite::Error) -> BrokerError {
    BrokerError::Store(e.to_string())
}

fn serde_role(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "USER",
        MessageRole::Assistant => "ASSISTANT",
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    let role = match role_str.as_str() {
        "ASSISTANT" => MessageRole::Assistant,
        _ => MessageRole::User,
    };
    let sources_json: String = row.get(5)?;
    let sources: Vec<MessageSource> = serde_json::from_str(&sources_json).unwrap_or_default();

    Ok(Message {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        role,
        body: row.get(3)?,
        timestamp: row.get(4)?,
        sources,
    })
}

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<Profile> {
    let type_str: String = row.get(1)?;
    let gender_str: String = row.get(3)?;
    Ok(Profile {
        id: row.get(0)?,
        profile_type: serde_json::from_value(serde_json::Value::String(type_str))
            .unwrap_or(crate::types::ProfileType::General),
        age: row.get(2)?,
        gender: serde_json::from_value(serde_json::Value::String(gender_str))
            .unwrap_or(crate::types::ProfileGender::Unspecified),
        existing_conditions: row.get(4)?,
    })
}

/// Serialize a serde-renamed enum variant to its string form.
fn enum_str<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(BrokerError::Store("unexpected enum encoding".into())),
    }
}
