//! Long-term memory index.
//!
//! Memories are short texts with a fixed-dimension embedding, ranked at
//! query time by cosine similarity. The scan is bounded to the most recent
//! [`SCAN_LIMIT`] rows; retrieval quality degrades gracefully rather than
//! the query cost growing without bound.

use rusqlite::OptionalExtension;
use tracing::instrument;

use parlance_core::id;

use crate::error::{Result, StoreError};
use crate::store::ConversationStore;

const SCAN_LIMIT: usize = 1024;

/// One ranked retrieval result.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub memory_id: String,
    pub text: String,
    pub similarity: f64,
}

/// Memory operations live on the conversation store — same connection,
/// same transactional guarantees.
pub trait MemoryIndex {
    fn insert_memory(&self, text: &str, embedding: &[f32]) -> Result<String>;
    fn get_memory_text(&self, memory_id: &str) -> Result<Option<String>>;
    fn search_memories(&self, query: &[f32], k: usize) -> Result<Vec<MemoryHit>>;
}

impl MemoryIndex for ConversationStore {
    fn insert_memory(&self, text: &str, embedding: &[f32]) -> Result<String> {
        let mem_id = id::memory();
        let now = chrono::Utc::now().to_rfc3339();
        let blob = embedding_to_blob(embedding);
        let db = self.connection().lock().unwrap();
        db.execute(
            "INSERT INTO memories (id, text, embedding, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![mem_id, text, blob, now],
        )?;
        Ok(mem_id)
    }

    fn get_memory_text(&self, memory_id: &str) -> Result<Option<String>> {
        let db = self.connection().lock().unwrap();
        Ok(db
            .query_row(
                "SELECT text FROM memories WHERE id = ?1",
                rusqlite::params![memory_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Top-k memories by cosine similarity to the query embedding.
    #[instrument(skip(self, query))]
    fn search_memories(&self, query: &[f32], k: usize) -> Result<Vec<MemoryHit>> {
        let db = self.connection().lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, text, embedding FROM memories ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![SCAN_LIMIT as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (memory_id, text, blob) = row?;
            let embedding = blob_to_embedding(&blob)?;
            if embedding.len() != query.len() {
                // Dimension drift after an embedding-model change; skip.
                continue;
            }
            hits.push(MemoryHit {
                memory_id,
                text,
                similarity: cosine(query, &embedding),
            });
        }
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(k);
        Ok(hits)
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::InvalidValue(
            "embedding blob length not a multiple of 4".to_string(),
        ));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn store() -> ConversationStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        ConversationStore::new(conn)
    }

    #[test]
    fn search_ranks_by_cosine_similarity() {
        let store = store();
        store.insert_memory("likes coffee", &[1.0, 0.0, 0.0]).unwrap();
        store.insert_memory("lives in Lyon", &[0.0, 1.0, 0.0]).unwrap();
        store.insert_memory("plays chess", &[0.7, 0.7, 0.0]).unwrap();

        let hits = store.search_memories(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "likes coffee");
        assert!((hits[0].similarity - 1.0).abs() < 1e-9);
        assert_eq!(hits[1].text, "plays chess");
    }

    #[test]
    fn dimension_mismatch_rows_are_skipped() {
        let store = store();
        store.insert_memory("old model", &[1.0, 0.0]).unwrap();
        store.insert_memory("new model", &[1.0, 0.0, 0.0]).unwrap();
        let hits = store.search_memories(&[1.0, 0.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "new model");
    }

    #[test]
    fn blob_round_trip() {
        let embedding = vec![0.25f32, -1.5, 3.125];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob_to_embedding(&blob).unwrap(), embedding);
    }
}
