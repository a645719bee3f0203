use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// A persisted conversation — one room, one log, one actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Opaque `conv_…` id, identical to the transport room name.
    pub id: String,
    pub owner: Option<String>,
    pub status: ConversationStatus,
    /// String-keyed client preferences, updated by mid-session Configuration.
    pub preferences: BTreeMap<String, String>,
    /// Highest stanza id accepted from the client (≥ 0).
    pub last_client_stanza: i32,
    /// Stanza id of the most recent server emission (≤ 0).
    pub last_server_stanza: i32,
    pub created_at: String,
    pub updated_at: String,
    pub soft_deleted_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            "deleted" => Ok(ConversationStatus::Deleted),
            other => Err(StoreError::InvalidValue(format!(
                "conversation status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(StoreError::InvalidValue(format!("role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(StoreError::InvalidValue(format!("sync status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Pending => "pending",
            CompletionStatus::Streaming => "streaming",
            CompletionStatus::Completed => "completed",
            CompletionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(CompletionStatus::Pending),
            "streaming" => Ok(CompletionStatus::Streaming),
            "completed" => Ok(CompletionStatus::Completed),
            "failed" => Ok(CompletionStatus::Failed),
            other => Err(StoreError::InvalidValue(format!(
                "completion status: {other}"
            ))),
        }
    }
}

/// One turn in a conversation. Messages are append-only; only
/// `completion_status` (and, for streamed answers, `contents` at
/// finalization) is ever updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Strictly increasing and contiguous from 1 within the conversation.
    pub sequence_number: i64,
    /// Linked-list back-pointer; `None` only for the first message.
    pub previous_id: Option<String>,
    pub role: Role,
    pub contents: String,
    /// Client-allocated id, used for idempotent offline reconciliation.
    pub local_id: Option<String>,
    pub server_id: Option<String>,
    pub sync_status: SyncStatus,
    pub completion_status: CompletionStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Audio attached to a finished sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentenceAudio {
    /// Format tag, e.g. `"pcm16/48000"`.
    pub format: String,
    pub frames: u32,
    pub duration_ms: u32,
    pub byte_size: u64,
}

/// The unit of streamed assistant output — also the granularity of TTS and
/// of resume after disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sentence {
    pub id: String,
    pub message_id: String,
    /// 0-based position within the owning message; gap-free once the
    /// message completes.
    pub index: u32,
    pub text: String,
    pub audio: Option<SentenceAudio>,
    pub completion_status: CompletionStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Pending => "pending",
            ToolStatus::Running => "running",
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
            ToolStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(ToolStatus::Pending),
            "running" => Ok(ToolStatus::Running),
            "success" => Ok(ToolStatus::Success),
            "error" => Ok(ToolStatus::Error),
            "cancelled" => Ok(ToolStatus::Cancelled),
            other => Err(StoreError::InvalidValue(format!("tool status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub message_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Option<Value>,
    pub status: ToolStatus,
    pub error_text: Option<String>,
    /// Order of this tool call within its message, from 1.
    pub sequence_number: u32,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Write-once record of a memory retrieved during generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUse {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub memory_id: String,
    pub query_text: String,
    pub similarity: f64,
    pub rank: u32,
    pub created_at: String,
}
