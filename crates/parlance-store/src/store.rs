use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::{instrument, warn};

use parlance_core::id;

use crate::error::{Result, StoreError};
use crate::types::{
    CompletionStatus, Conversation, ConversationStatus, Message, MemoryUse, Role, Sentence,
    SentenceAudio, SyncStatus, ToolStatus, ToolUse,
};

/// Transient-busy retry budget. Exhaustion surfaces
/// [`StoreError::Unavailable`], which the actor treats as fatal.
const BUSY_ATTEMPTS: u32 = 4;
const BUSY_BASE_MS: u64 = 25;

/// Durable append-only conversation log.
///
/// Wraps a single SQLite connection in a `Mutex`; the actor is the sole
/// writer for its conversation, so contention is across conversations only.
pub struct ConversationStore {
    db: Mutex<Connection>,
}

/// Parameters for [`ConversationStore::append_message`].
#[derive(Debug, Default)]
pub struct NewMessage<'a> {
    pub conversation_id: &'a str,
    pub role: Option<Role>,
    pub contents: &'a str,
    pub previous_id: Option<&'a str>,
    /// Client-allocated id for offline reconciliation; a duplicate returns
    /// the existing row instead of appending.
    pub local_id: Option<&'a str>,
    /// Explicit entity id (client-supplied message ids); allocated when
    /// absent.
    pub id: Option<&'a str>,
    pub completion_status: Option<CompletionStatus>,
}

impl ConversationStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(dir) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(250))?;
        crate::db::init_db(&conn)?;
        Ok(Self::new(conn))
    }

    // -- conversations ------------------------------------------------------

    #[instrument(skip(self, preferences))]
    pub fn create_conversation(
        &self,
        preferences: &BTreeMap<String, String>,
    ) -> Result<Conversation> {
        let conv_id = id::conversation();
        let now = chrono::Utc::now().to_rfc3339();
        let prefs_json = serde_json::to_string(preferences)?;

        let db = self.db.lock().unwrap();
        with_busy_retry(|| {
            db.execute(
                "INSERT INTO conversations (id, status, preferences, created_at, updated_at)
                 VALUES (?1, 'active', ?2, ?3, ?3)",
                rusqlite::params![conv_id, prefs_json, now],
            )
        })?;

        Ok(Conversation {
            id: conv_id,
            owner: None,
            status: ConversationStatus::Active,
            preferences: preferences.clone(),
            last_client_stanza: 0,
            last_server_stanza: 0,
            created_at: now.clone(),
            updated_at: now,
            soft_deleted_at: None,
        })
    }

    /// Load a conversation by id. Soft-deleted rows are invisible.
    #[instrument(skip(self))]
    pub fn load_conversation(&self, conv_id: &str) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, owner, status, preferences, last_client_stanza, last_server_stanza,
                    created_at, updated_at, soft_deleted_at
             FROM conversations WHERE id = ?1 AND soft_deleted_at IS NULL",
            rusqlite::params![conv_id],
            row_to_conversation,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "conversation",
            id: conv_id.to_string(),
        })?
    }

    /// Replace the preference map (mid-session Configuration update).
    pub fn update_preferences(
        &self,
        conv_id: &str,
        preferences: &BTreeMap<String, String>,
    ) -> Result<()> {
        let prefs_json = serde_json::to_string(preferences)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = with_busy_retry(|| {
            db.execute(
                "UPDATE conversations SET preferences = ?1, updated_at = ?2
                 WHERE id = ?3 AND soft_deleted_at IS NULL",
                rusqlite::params![prefs_json, now, conv_id],
            )
        })?;
        ensure_found(changed, "conversation", conv_id)
    }

    /// Persist the stanza counters so they survive actor teardown.
    pub fn checkpoint_stanzas(
        &self,
        conv_id: &str,
        last_client: i32,
        last_server: i32,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = with_busy_retry(|| {
            db.execute(
                "UPDATE conversations
                 SET last_client_stanza = ?1, last_server_stanza = ?2
                 WHERE id = ?3",
                rusqlite::params![last_client, last_server, conv_id],
            )
        })?;
        ensure_found(changed, "conversation", conv_id)
    }

    #[instrument(skip(self))]
    pub fn soft_delete_conversation(&self, conv_id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = with_busy_retry(|| {
            db.execute(
                "UPDATE conversations
                 SET status = 'deleted', soft_deleted_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND soft_deleted_at IS NULL",
                rusqlite::params![now, conv_id],
            )
        })?;
        ensure_found(changed, "conversation", conv_id)
    }

    // -- messages -----------------------------------------------------------

    /// Append a message, assigning `sequence_number = max(existing) + 1`
    /// inside one transaction so concurrent writers cannot collide.
    ///
    /// Idempotent on `local_id`: a repeated append with a known local id
    /// returns the already-persisted row untouched.
    #[instrument(skip(self, new), fields(conversation = %new.conversation_id))]
    pub fn append_message(&self, new: NewMessage<'_>) -> Result<Message> {
        let role = new.role.unwrap_or(Role::User);
        let completion = new.completion_status.unwrap_or(CompletionStatus::Completed);
        let now = chrono::Utc::now().to_rfc3339();

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        if let Some(local_id) = new.local_id {
            let existing = tx
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages
                              WHERE conversation_id = ?1 AND local_id = ?2"),
                    rusqlite::params![new.conversation_id, local_id],
                    row_to_message,
                )
                .optional()?;
            if let Some(found) = existing {
                tx.commit()?;
                return found;
            }
        }

        let next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM messages
             WHERE conversation_id = ?1",
            rusqlite::params![new.conversation_id],
            |row| row.get(0),
        )?;

        // Every non-first message links back to its predecessor.
        let previous_id: Option<String> = match new.previous_id {
            Some(p) => Some(p.to_string()),
            None if next_seq > 1 => tx.query_row(
                "SELECT id FROM messages
                 WHERE conversation_id = ?1 AND sequence_number = ?2",
                rusqlite::params![new.conversation_id, next_seq - 1],
                |row| row.get(0),
            )?,
            None => None,
        };

        let msg_id = new.id.map(String::from).unwrap_or_else(id::message);
        let sync_status = SyncStatus::Synced;

        tx.execute(
            "INSERT INTO messages
             (id, conversation_id, sequence_number, previous_id, role, contents,
              local_id, sync_status, completion_status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            rusqlite::params![
                msg_id,
                new.conversation_id,
                next_seq,
                previous_id,
                role.as_str(),
                new.contents,
                new.local_id,
                sync_status.as_str(),
                completion.as_str(),
                now,
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, new.conversation_id],
        )?;
        tx.commit()?;

        Ok(Message {
            id: msg_id,
            conversation_id: new.conversation_id.to_string(),
            sequence_number: next_seq,
            previous_id,
            role,
            contents: new.contents.to_string(),
            local_id: new.local_id.map(String::from),
            server_id: None,
            sync_status,
            completion_status: completion,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Update completion status, optionally replacing `contents` (used when
    /// a streamed answer finalizes to the concatenation of its sentences).
    pub fn update_message_status(
        &self,
        msg_id: &str,
        status: CompletionStatus,
        contents: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = match contents {
            Some(text) => with_busy_retry(|| {
                db.execute(
                    "UPDATE messages
                     SET completion_status = ?1, contents = ?2, updated_at = ?3
                     WHERE id = ?4",
                    rusqlite::params![status.as_str(), text, now, msg_id],
                )
            })?,
            None => with_busy_retry(|| {
                db.execute(
                    "UPDATE messages SET completion_status = ?1, updated_at = ?2
                     WHERE id = ?3",
                    rusqlite::params![status.as_str(), now, msg_id],
                )
            })?,
        };
        ensure_found(changed, "message", msg_id)
    }

    pub fn find_message(&self, msg_id: &str) -> Result<Option<Message>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            rusqlite::params![msg_id],
            row_to_message,
        )
        .optional()?
        .transpose()
    }

    /// Messages with `sequence_number` greater than the given point,
    /// ordered.
    pub fn messages_since(&self, conv_id: &str, sequence_number: i64) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND sequence_number > ?2
             ORDER BY sequence_number"
        ))?;
        let rows = stmt.query_map(rusqlite::params![conv_id, sequence_number], row_to_message)?;
        collect_messages(rows)
    }

    /// The most recent `limit` messages, in conversation order.
    pub fn recent_messages(&self, conv_id: &str, limit: usize) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY sequence_number DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![conv_id, limit as i64], row_to_message)?;
        let mut messages = collect_messages(rows)?;
        messages.reverse();
        Ok(messages)
    }

    // -- sentences ----------------------------------------------------------

    pub fn append_sentence(&self, message_id: &str, index: u32, text: &str) -> Result<Sentence> {
        let snt_id = id::sentence();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        with_busy_retry(|| {
            db.execute(
                "INSERT INTO sentences (id, message_id, idx, text, completion_status,
                                        created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'streaming', ?5, ?5)",
                rusqlite::params![snt_id, message_id, index, text, now],
            )
        })?;
        Ok(Sentence {
            id: snt_id,
            message_id: message_id.to_string(),
            index,
            text: text.to_string(),
            audio: None,
            completion_status: CompletionStatus::Streaming,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn update_sentence_audio(&self, sentence_id: &str, audio: &SentenceAudio) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = with_busy_retry(|| {
            db.execute(
                "UPDATE sentences
                 SET audio_format = ?1, audio_frames = ?2, audio_duration_ms = ?3,
                     audio_byte_size = ?4, updated_at = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    audio.format,
                    audio.frames,
                    audio.duration_ms,
                    audio.byte_size as i64,
                    now,
                    sentence_id
                ],
            )
        })?;
        ensure_found(changed, "sentence", sentence_id)
    }

    pub fn finalize_sentence(&self, sentence_id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = with_busy_retry(|| {
            db.execute(
                "UPDATE sentences SET completion_status = 'completed', updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, sentence_id],
            )
        })?;
        ensure_found(changed, "sentence", sentence_id)
    }

    /// All sentences of a message in index order.
    pub fn sentences_for(&self, message_id: &str) -> Result<Vec<Sentence>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, message_id, idx, text, audio_format, audio_frames,
                    audio_duration_ms, audio_byte_size, completion_status,
                    created_at, updated_at
             FROM sentences WHERE message_id = ?1 ORDER BY idx",
        )?;
        let rows = stmt.query_map(rusqlite::params![message_id], row_to_sentence)?;
        let mut sentences = Vec::new();
        for row in rows {
            sentences.push(row??);
        }
        Ok(sentences)
    }

    // -- tool uses ----------------------------------------------------------

    #[instrument(skip(self, arguments))]
    pub fn record_tool_use(
        &self,
        message_id: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<ToolUse> {
        let tu_id = id::tool_use();
        let now = chrono::Utc::now().to_rfc3339();
        let args_json = serde_json::to_string(arguments)?;

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let next_seq: u32 = tx.query_row(
            "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM tool_uses
             WHERE message_id = ?1",
            rusqlite::params![message_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO tool_uses (id, message_id, tool_name, arguments, status,
                                    sequence_number, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
            rusqlite::params![tu_id, message_id, tool_name, args_json, next_seq, now],
        )?;
        tx.commit()?;

        Ok(ToolUse {
            id: tu_id,
            message_id: message_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            result: None,
            status: ToolStatus::Pending,
            error_text: None,
            sequence_number: next_seq,
            created_at: now,
            completed_at: None,
        })
    }

    /// All tool uses of a message in invocation order.
    pub fn tool_uses_for(&self, message_id: &str) -> Result<Vec<ToolUse>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, message_id, tool_name, arguments, result, status, error_text,
                    sequence_number, created_at, completed_at
             FROM tool_uses WHERE message_id = ?1 ORDER BY sequence_number",
        )?;
        let rows = stmt.query_map(rusqlite::params![message_id], row_to_tool_use)?;
        let mut uses = Vec::new();
        for row in rows {
            uses.push(row??);
        }
        Ok(uses)
    }

    pub fn update_tool_use(
        &self,
        tool_use_id: &str,
        status: ToolStatus,
        result: Option<&Value>,
        error_text: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let result_json = result.map(serde_json::to_string).transpose()?;
        let completed_at = matches!(
            status,
            ToolStatus::Success | ToolStatus::Error | ToolStatus::Cancelled
        )
        .then(|| now.clone());

        let db = self.db.lock().unwrap();
        let changed = with_busy_retry(|| {
            db.execute(
                "UPDATE tool_uses
                 SET status = ?1,
                     result = COALESCE(?2, result),
                     error_text = COALESCE(?3, error_text),
                     completed_at = COALESCE(?4, completed_at)
                 WHERE id = ?5",
                rusqlite::params![status.as_str(), result_json, error_text, completed_at, tool_use_id],
            )
        })?;
        ensure_found(changed, "tool use", tool_use_id)
    }

    // -- memory uses & commentary ------------------------------------------

    pub fn record_memory_use(
        &self,
        conv_id: &str,
        message_id: &str,
        memory_id: &str,
        query_text: &str,
        similarity: f64,
        rank: u32,
    ) -> Result<MemoryUse> {
        let use_id = id::memory();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        with_busy_retry(|| {
            db.execute(
                "INSERT INTO memory_uses (id, conversation_id, message_id, memory_id,
                                          query_text, similarity, rank, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![use_id, conv_id, message_id, memory_id, query_text, similarity, rank, now],
            )
        })?;
        Ok(MemoryUse {
            id: use_id,
            conversation_id: conv_id.to_string(),
            message_id: message_id.to_string(),
            memory_id: memory_id.to_string(),
            query_text: query_text.to_string(),
            similarity,
            rank,
            created_at: now,
        })
    }

    pub fn record_commentary(&self, message_id: &str, content: &str, category: &str) -> Result<()> {
        let note_id = id::memory();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        with_busy_retry(|| {
            db.execute(
                "INSERT INTO commentaries (id, message_id, content, category, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![note_id, message_id, content, category, now],
            )
        })?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> &Mutex<Connection> {
        &self.db
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sequence_number, previous_id, role, \
     contents, local_id, server_id, sync_status, completion_status, created_at, updated_at";

fn ensure_found(changed: usize, entity: &'static str, entity_id: &str) -> Result<()> {
    if changed == 0 {
        return Err(StoreError::NotFound {
            entity,
            id: entity_id.to_string(),
        });
    }
    Ok(())
}

/// Retry a single statement on SQLITE_BUSY/LOCKED with bounded exponential
/// backoff. Any other error propagates immediately.
fn with_busy_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut delay = BUSY_BASE_MS;
    for attempt in 1..=BUSY_ATTEMPTS {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) && attempt < BUSY_ATTEMPTS => {
                warn!(attempt, delay_ms = delay, "database busy, retrying");
                std::thread::sleep(Duration::from_millis(delay));
                delay *= 2;
            }
            Err(e) if is_busy(&e) => return Err(StoreError::Unavailable(e.to_string())),
            Err(e) => return Err(StoreError::Database(e)),
        }
    }
    unreachable!("busy retry loop exited without returning")
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::DatabaseBusy
                || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Conversation>> {
    let status_str: String = row.get(2)?;
    let prefs_json: String = row.get(3)?;
    Ok((|| {
        Ok(Conversation {
            id: row.get(0)?,
            owner: row.get(1)?,
            status: ConversationStatus::parse(&status_str)?,
            preferences: serde_json::from_str(&prefs_json)?,
            last_client_stanza: row.get(4)?,
            last_server_stanza: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            soft_deleted_at: row.get(8)?,
        })
    })())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Message>> {
    let role_str: String = row.get(4)?;
    let sync_str: String = row.get(8)?;
    let completion_str: String = row.get(9)?;
    Ok((|| {
        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sequence_number: row.get(2)?,
            previous_id: row.get(3)?,
            role: Role::parse(&role_str)?,
            contents: row.get(5)?,
            local_id: row.get(6)?,
            server_id: row.get(7)?,
            sync_status: SyncStatus::parse(&sync_str)?,
            completion_status: CompletionStatus::parse(&completion_str)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    })())
}

fn row_to_sentence(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Sentence>> {
    let completion_str: String = row.get(8)?;
    let audio_format: Option<String> = row.get(4)?;
    let audio = match audio_format {
        Some(format) => Some(SentenceAudio {
            format,
            frames: row.get(5)?,
            duration_ms: row.get(6)?,
            byte_size: row.get::<_, i64>(7)? as u64,
        }),
        None => None,
    };
    Ok((|| {
        Ok(Sentence {
            id: row.get(0)?,
            message_id: row.get(1)?,
            index: row.get(2)?,
            text: row.get(3)?,
            audio,
            completion_status: CompletionStatus::parse(&completion_str)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    })())
}

fn row_to_tool_use(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ToolUse>> {
    let args_json: String = row.get(3)?;
    let result_json: Option<String> = row.get(4)?;
    let status_str: String = row.get(5)?;
    Ok((|| {
        Ok(ToolUse {
            id: row.get(0)?,
            message_id: row.get(1)?,
            tool_name: row.get(2)?,
            arguments: serde_json::from_str(&args_json)?,
            result: result_json.as_deref().map(serde_json::from_str).transpose()?,
            status: ToolStatus::parse(&status_str)?,
            error_text: row.get(6)?,
            sequence_number: row.get(7)?,
            created_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    })())
}

fn collect_messages(
    rows: impl Iterator<Item = rusqlite::Result<Result<Message>>>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row??);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConversationStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        ConversationStore::new(conn)
    }

    #[test]
    fn sequence_numbers_are_contiguous_from_one() {
        let store = store();
        let conv = store.create_conversation(&BTreeMap::new()).unwrap();
        for i in 1..=5 {
            let msg = store
                .append_message(NewMessage {
                    conversation_id: &conv.id,
                    contents: "hi",
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(msg.sequence_number, i);
        }
    }

    #[test]
    fn non_first_messages_link_to_predecessor() {
        let store = store();
        let conv = store.create_conversation(&BTreeMap::new()).unwrap();
        let first = store
            .append_message(NewMessage {
                conversation_id: &conv.id,
                contents: "a",
                ..Default::default()
            })
            .unwrap();
        assert!(first.previous_id.is_none());
        let second = store
            .append_message(NewMessage {
                conversation_id: &conv.id,
                contents: "b",
                ..Default::default()
            })
            .unwrap();
        assert_eq!(second.previous_id.as_deref(), Some(first.id.as_str()));
    }

    #[test]
    fn append_with_known_local_id_is_idempotent() {
        let store = store();
        let conv = store.create_conversation(&BTreeMap::new()).unwrap();
        let first = store
            .append_message(NewMessage {
                conversation_id: &conv.id,
                contents: "offline draft",
                local_id: Some("local-1"),
                ..Default::default()
            })
            .unwrap();
        let replay = store
            .append_message(NewMessage {
                conversation_id: &conv.id,
                contents: "offline draft (retransmitted)",
                local_id: Some("local-1"),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(replay.id, first.id);
        assert_eq!(replay.contents, "offline draft");
        assert_eq!(store.messages_since(&conv.id, 0).unwrap().len(), 1);
    }

    #[test]
    fn soft_deleted_conversations_are_invisible() {
        let store = store();
        let conv = store.create_conversation(&BTreeMap::new()).unwrap();
        store.soft_delete_conversation(&conv.id).unwrap();
        assert!(matches!(
            store.load_conversation(&conv.id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn streamed_message_finalizes_to_sentence_concatenation() {
        let store = store();
        let conv = store.create_conversation(&BTreeMap::new()).unwrap();
        let msg = store
            .append_message(NewMessage {
                conversation_id: &conv.id,
                role: Some(Role::Assistant),
                completion_status: Some(CompletionStatus::Streaming),
                ..Default::default()
            })
            .unwrap();

        let s0 = store.append_sentence(&msg.id, 0, "First. ").unwrap();
        let s1 = store.append_sentence(&msg.id, 1, "Second.").unwrap();
        store.finalize_sentence(&s0.id).unwrap();
        store.finalize_sentence(&s1.id).unwrap();

        let full: String = store
            .sentences_for(&msg.id)
            .unwrap()
            .iter()
            .map(|s| s.text.as_str())
            .collect();
        store
            .update_message_status(&msg.id, CompletionStatus::Completed, Some(&full))
            .unwrap();

        let loaded = store.find_message(&msg.id).unwrap().unwrap();
        assert_eq!(loaded.contents, "First. Second.");
        assert_eq!(loaded.completion_status, CompletionStatus::Completed);
    }

    #[test]
    fn tool_uses_are_sequenced_within_message() {
        let store = store();
        let conv = store.create_conversation(&BTreeMap::new()).unwrap();
        let msg = store
            .append_message(NewMessage {
                conversation_id: &conv.id,
                role: Some(Role::Assistant),
                ..Default::default()
            })
            .unwrap();
        let a = store
            .record_tool_use(&msg.id, "get_weather", &serde_json::json!({"city": "Tokyo"}))
            .unwrap();
        let b = store
            .record_tool_use(&msg.id, "get_time", &serde_json::json!({}))
            .unwrap();
        assert_eq!(a.sequence_number, 1);
        assert_eq!(b.sequence_number, 2);

        store
            .update_tool_use(
                &a.id,
                ToolStatus::Success,
                Some(&serde_json::json!({"temperatureC": 22})),
                None,
            )
            .unwrap();
    }

    #[test]
    fn open_creates_and_reopens_database_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("parlance.db");
        let path = path.to_str().unwrap();

        let store = ConversationStore::open(path).unwrap();
        let conv = store.create_conversation(&BTreeMap::new()).unwrap();
        drop(store);

        let reopened = ConversationStore::open(path).unwrap();
        assert_eq!(reopened.load_conversation(&conv.id).unwrap().id, conv.id);
    }

    #[test]
    fn stanza_checkpoints_round_trip() {
        let store = store();
        let conv = store.create_conversation(&BTreeMap::new()).unwrap();
        store.checkpoint_stanzas(&conv.id, 7, -12).unwrap();
        let loaded = store.load_conversation(&conv.id).unwrap();
        assert_eq!(loaded.last_client_stanza, 7);
        assert_eq!(loaded.last_server_stanza, -12);
    }
}
