//! Envelope and body types for the room wire protocol.
//!
//! An envelope carries a signed stanza id (positive = client, negative =
//! server), the conversation id, a numeric type code, an optional metadata
//! map, and a type-discriminated body. Codes 1–16 form the closed set the
//! runtime interprets; 17–31 are reserved and decode to [`Body::Unknown`],
//! which is forwarded to a logging sink and never reaches the state machine.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved meta keys carried for distributed tracing.
pub const META_TRACE_ID: &str = "messaging.trace_id";
pub const META_SPAN_ID: &str = "messaging.span_id";

/// Numeric type codes — fixed, part of the wire contract.
pub mod codes {
    pub const ERROR: u16 = 1;
    pub const USER_MESSAGE: u16 = 2;
    pub const ASSISTANT_MESSAGE: u16 = 3;
    pub const AUDIO_CHUNK: u16 = 4;
    pub const REASONING_STEP: u16 = 5;
    pub const TOOL_USE_REQUEST: u16 = 6;
    pub const TOOL_USE_RESULT: u16 = 7;
    pub const ACKNOWLEDGEMENT: u16 = 8;
    pub const TRANSCRIPTION: u16 = 9;
    pub const CONTROL_STOP: u16 = 10;
    pub const CONTROL_VARIATION: u16 = 11;
    pub const CONFIGURATION: u16 = 12;
    pub const START_ANSWER: u16 = 13;
    pub const MEMORY_TRACE: u16 = 14;
    pub const COMMENTARY: u16 = 15;
    pub const ASSISTANT_SENTENCE: u16 = 16;

    /// Reserved band for feedback/memory/optimization extensions.
    pub const RESERVED_MIN: u16 = 17;
    pub const RESERVED_MAX: u16 = 31;
}

/// A framed unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Per-conversation signed counter. Client envelopes are positive and
    /// strictly increasing; server envelopes are negative and strictly
    /// decreasing. Signs never mix on either side.
    pub stanza_id: i32,
    /// Opaque conversation id (`conv_…`), possibly empty on the first
    /// Configuration from a new client.
    pub conversation_id: String,
    /// String-keyed metadata; may carry [`META_TRACE_ID`] / [`META_SPAN_ID`].
    pub meta: BTreeMap<String, String>,
    pub body: Body,
}

impl Envelope {
    pub fn new(stanza_id: i32, conversation_id: impl Into<String>, body: Body) -> Self {
        Self {
            stanza_id,
            conversation_id: conversation_id.into(),
            meta: BTreeMap::new(),
            body,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// Type-discriminated envelope body. Exactly one variant per registry code,
/// plus [`Body::Unknown`] for reserved/unrecognised codes.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Error(ErrorBody),
    UserMessage(UserMessageBody),
    AssistantMessage(AssistantMessageBody),
    AudioChunk(AudioChunkBody),
    ReasoningStep(ReasoningStepBody),
    ToolUseRequest(ToolUseRequestBody),
    ToolUseResult(ToolUseResultBody),
    Acknowledgement(AcknowledgementBody),
    Transcription(TranscriptionBody),
    ControlStop,
    ControlVariation(ControlVariationBody),
    Configuration(ConfigurationBody),
    StartAnswer(StartAnswerBody),
    MemoryTrace(MemoryTraceBody),
    Commentary(CommentaryBody),
    AssistantSentence(AssistantSentenceBody),
    /// Forward-compatibility escape hatch: the raw CBOR body of a code the
    /// runtime does not interpret. Round-trips byte-compatibly.
    Unknown {
        type_code: u16,
        value: ciborium::Value,
    },
}

impl Body {
    pub fn type_code(&self) -> u16 {
        match self {
            Body::Error(_) => codes::ERROR,
            Body::UserMessage(_) => codes::USER_MESSAGE,
            Body::AssistantMessage(_) => codes::ASSISTANT_MESSAGE,
            Body::AudioChunk(_) => codes::AUDIO_CHUNK,
            Body::ReasoningStep(_) => codes::REASONING_STEP,
            Body::ToolUseRequest(_) => codes::TOOL_USE_REQUEST,
            Body::ToolUseResult(_) => codes::TOOL_USE_RESULT,
            Body::Acknowledgement(_) => codes::ACKNOWLEDGEMENT,
            Body::Transcription(_) => codes::TRANSCRIPTION,
            Body::ControlStop => codes::CONTROL_STOP,
            Body::ControlVariation(_) => codes::CONTROL_VARIATION,
            Body::Configuration(_) => codes::CONFIGURATION,
            Body::StartAnswer(_) => codes::START_ANSWER,
            Body::MemoryTrace(_) => codes::MEMORY_TRACE,
            Body::Commentary(_) => codes::COMMENTARY,
            Body::AssistantSentence(_) => codes::ASSISTANT_SENTENCE,
            Body::Unknown { type_code, .. } => *type_code,
        }
    }

    /// Stable lowercase label used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Body::Error(_) => "error",
            Body::UserMessage(_) => "user-message",
            Body::AssistantMessage(_) => "assistant-message",
            Body::AudioChunk(_) => "audio-chunk",
            Body::ReasoningStep(_) => "reasoning-step",
            Body::ToolUseRequest(_) => "tool-use-request",
            Body::ToolUseResult(_) => "tool-use-result",
            Body::Acknowledgement(_) => "acknowledgement",
            Body::Transcription(_) => "transcription",
            Body::ControlStop => "control-stop",
            Body::ControlVariation(_) => "control-variation",
            Body::Configuration(_) => "configuration",
            Body::StartAnswer(_) => "start-answer",
            Body::MemoryTrace(_) => "memory-trace",
            Body::Commentary(_) => "commentary",
            Body::AssistantSentence(_) => "assistant-sentence",
            Body::Unknown { .. } => "unknown",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Body::Unknown { .. })
    }
}

/// Severity of an outbound Error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub severity: Severity,
    pub error_code: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageBody {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    pub content: String,
    /// Client-allocated id for offline reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

/// Non-streaming assistant reply. The streaming path uses
/// [`StartAnswerBody`] + [`AssistantSentenceBody`] instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessageBody {
    pub id: String,
    pub previous_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkBody {
    /// Format tag, e.g. `"pcm16/48000"`.
    pub format: String,
    pub duration_ms: u32,
    /// Encoded audio frames, in playback order.
    pub frames: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningStepBody {
    pub message_id: String,
    pub index: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseRequestBody {
    pub id: String,
    pub message_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseResultBody {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgementBody {
    pub acknowledged_stanza_id: i32,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionBody {
    pub text: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariationMode {
    /// Supersede a pending user message with new content.
    Edit,
    /// Regenerate the answer to an already-answered user message.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlVariationBody {
    pub target_message_id: String,
    pub mode: VariationMode,
}

/// Mandatory first (and reconnect) exchange. Client → server establishes or
/// resumes a conversation; server → client confirms the id and features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Highest |server stanza| the client has seen; drives suffix replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence_seen: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnswerBody {
    pub id: String,
    pub previous_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTraceBody {
    pub memory_id: String,
    pub message_id: String,
    /// Snippet of the recalled memory, not the full text.
    pub content: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentaryBody {
    pub message_id: String,
    pub content: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantSentenceBody {
    pub message_id: String,
    pub index: u32,
    pub text: String,
    /// Set on the terminal sentence of a streamed answer; the owning
    /// message completes at that moment.
    pub is_final: bool,
}
