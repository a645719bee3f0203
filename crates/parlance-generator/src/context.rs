//! Context assembly for one generation turn.
//!
//! The transcript is rebuilt from the persistent log each turn: the most
//! recent N messages (the just-appended user message included), mapped to
//! raw chat-message JSON. Memory retrieval is best-effort enrichment — a
//! failing embedding backend degrades to no memories, never to a failed
//! generation.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use parlance_backends::Backends;
use parlance_store::types::{CompletionStatus, Role};
use parlance_store::{ConversationStore, MemoryIndex};

/// One retrieved memory, ranked by similarity (rank 0 = best).
#[derive(Debug, Clone)]
pub struct RankedMemory {
    pub memory_id: String,
    pub text: String,
    pub similarity: f64,
    pub rank: u32,
}

/// Map the recent conversation log into raw chat messages, oldest first.
///
/// Messages with no contents yet (streaming placeholders) are skipped;
/// system rows never reach the model (they are runtime bookkeeping, not
/// prompt material).
pub fn assemble_history(
    store: &ConversationStore,
    conversation_id: &str,
    limit: usize,
) -> Result<Vec<Value>, parlance_store::StoreError> {
    let recent = store.recent_messages(conversation_id, limit)?;
    Ok(recent
        .iter()
        .filter(|m| m.role != Role::System && !m.contents.is_empty())
        .map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": m.contents,
            })
        })
        .collect())
}

/// Retrieve the top-k memories for the user text. Returns an empty list
/// when no embedding backend is configured or retrieval fails.
pub async fn retrieve_memories(
    store: &Arc<ConversationStore>,
    backends: &Backends,
    user_text: &str,
    k: usize,
) -> Vec<RankedMemory> {
    let Some(embedding) = &backends.embedding else {
        return Vec::new();
    };
    if k == 0 {
        return Vec::new();
    }

    let query = match embedding.embed(user_text).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "memory retrieval skipped: embedding failed");
            return Vec::new();
        }
    };

    match store.search_memories(&query, k) {
        Ok(hits) => hits
            .into_iter()
            .enumerate()
            .map(|(rank, hit)| RankedMemory {
                memory_id: hit.memory_id,
                text: hit.text,
                similarity: hit.similarity,
                rank: rank as u32,
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "memory retrieval skipped: index search failed");
            Vec::new()
        }
    }
}

/// Fold retrieved memories into the system prompt.
pub fn compose_system(base: &str, memories: &[RankedMemory]) -> String {
    if memories.is_empty() {
        return base.to_string();
    }
    let mut system = String::from(base);
    system.push_str("\n\n## Relevant memories\n");
    for m in memories {
        system.push_str(&format!("- {}\n", m.text));
    }
    system
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlance_store::NewMessage;
    use rusqlite::Connection;

    fn store() -> ConversationStore {
        let conn = Connection::open_in_memory().unwrap();
        parlance_store::db::init_db(&conn).unwrap();
        ConversationStore::new(conn)
    }

    #[test]
    fn history_maps_roles_and_skips_empty() {
        let store = store();
        let conv = store
            .create_conversation(&Default::default())
            .unwrap();
        store
            .append_message(NewMessage {
                conversation_id: &conv.id,
                contents: "hello",
                ..Default::default()
            })
            .unwrap();
        store
            .append_message(NewMessage {
                conversation_id: &conv.id,
                role: Some(Role::Assistant),
                contents: "hi there",
                ..Default::default()
            })
            .unwrap();
        // Streaming placeholder with no contents yet — must not reach the model.
        store
            .append_message(NewMessage {
                conversation_id: &conv.id,
                role: Some(Role::Assistant),
                completion_status: Some(CompletionStatus::Streaming),
                ..Default::default()
            })
            .unwrap();

        let history = assemble_history(&store, &conv.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["role"], "user");
        assert_eq!(history[1]["role"], "assistant");
    }

    #[test]
    fn system_prompt_gains_memory_section() {
        let memories = vec![RankedMemory {
            memory_id: "mem_1".to_string(),
            text: "prefers metric units".to_string(),
            similarity: 0.9,
            rank: 0,
        }];
        let system = compose_system("You are helpful.", &memories);
        assert!(system.contains("Relevant memories"));
        assert!(system.contains("prefers metric units"));
        assert_eq!(compose_system("base", &[]), "base");
    }
}
