use bytes::Bytes;
use serde_json::Value;

use parlance_audio::AudioFormat;

/// PCM attached to a finished sentence.
#[derive(Debug, Clone)]
pub struct SentenceAudio {
    pub pcm: Bytes,
    pub format: AudioFormat,
}

/// Events a response generator pushes to its consumer (the actor).
///
/// Ordering is total and consistent with causation: reasoning precedes the
/// sentences that depend on it, a `ToolCompleted` follows its matching
/// `ToolRequested`, and sentence indices are strictly increasing. After
/// `Completed`, `Cancelled` or `Failed`, nothing further is emitted.
#[derive(Debug, Clone)]
pub enum GeneratorEvent {
    Reasoning {
        index: u32,
        text: String,
    },
    /// A memory was retrieved during context assembly.
    MemoryTraced {
        memory_id: String,
        content: String,
        similarity: f64,
        rank: u32,
        query: String,
    },
    /// The model asked for a tool; `request_id` correlates the completion.
    ToolRequested {
        request_id: String,
        name: String,
        arguments: Value,
    },
    ToolCompleted {
        request_id: String,
        success: bool,
        result: Option<Value>,
        error_text: Option<String>,
    },
    SentenceReady {
        index: u32,
        text: String,
        is_final: bool,
        audio: Option<SentenceAudio>,
    },
    /// Generation finished; `full_text` is the concatenation of all emitted
    /// sentence texts in index order.
    Completed {
        full_text: String,
    },
    Cancelled,
    Failed {
        reason: String,
    },
}

impl GeneratorEvent {
    /// True for the three terminal events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GeneratorEvent::Completed { .. }
                | GeneratorEvent::Cancelled
                | GeneratorEvent::Failed { .. }
        )
    }
}
