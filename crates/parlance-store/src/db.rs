use rusqlite::Connection;

use crate::error::Result;

/// Initialise the conversation-log schema and its indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY,
            owner               TEXT,
            status              TEXT NOT NULL DEFAULT 'active',
            preferences         TEXT NOT NULL DEFAULT '{}',
            last_client_stanza  INTEGER NOT NULL DEFAULT 0,
            last_server_stanza  INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            soft_deleted_at     TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                 TEXT PRIMARY KEY,
            conversation_id    TEXT NOT NULL REFERENCES conversations(id),
            sequence_number    INTEGER NOT NULL,
            previous_id        TEXT,
            role               TEXT NOT NULL,
            contents           TEXT NOT NULL DEFAULT '',
            local_id           TEXT,
            server_id          TEXT,
            sync_status        TEXT NOT NULL DEFAULT 'synced',
            completion_status  TEXT NOT NULL DEFAULT 'pending',
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL,
            UNIQUE(conversation_id, sequence_number)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_local
            ON messages(conversation_id, local_id) WHERE local_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_messages_conv
            ON messages(conversation_id, sequence_number);

        CREATE TABLE IF NOT EXISTS sentences (
            id                 TEXT PRIMARY KEY,
            message_id         TEXT NOT NULL REFERENCES messages(id),
            idx                INTEGER NOT NULL,
            text               TEXT NOT NULL,
            audio_format       TEXT,
            audio_frames       INTEGER,
            audio_duration_ms  INTEGER,
            audio_byte_size    INTEGER,
            completion_status  TEXT NOT NULL DEFAULT 'streaming',
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL,
            UNIQUE(message_id, idx)
        );

        CREATE TABLE IF NOT EXISTS tool_uses (
            id               TEXT PRIMARY KEY,
            message_id       TEXT NOT NULL REFERENCES messages(id),
            tool_name        TEXT NOT NULL,
            arguments        TEXT NOT NULL,
            result           TEXT,
            status           TEXT NOT NULL DEFAULT 'pending',
            error_text       TEXT,
            sequence_number  INTEGER NOT NULL,
            created_at       TEXT NOT NULL,
            completed_at     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tool_uses_message
            ON tool_uses(message_id, sequence_number);

        CREATE TABLE IF NOT EXISTS memory_uses (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL,
            message_id       TEXT NOT NULL,
            memory_id        TEXT NOT NULL,
            query_text       TEXT NOT NULL,
            similarity       REAL NOT NULL,
            rank             INTEGER NOT NULL,
            created_at       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS commentaries (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL,
            content     TEXT NOT NULL,
            category    TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memories (
            id          TEXT PRIMARY KEY,
            text        TEXT NOT NULL,
            embedding   BLOB NOT NULL,
            created_at  TEXT NOT NULL
        );",
    )?;
    Ok(())
}
