pub mod asr;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod retry;
pub mod tool;
pub mod tts;

use std::sync::Arc;

pub use error::{BackendError, Result};
pub use llm::{ChatRequest, HttpLanguageBackend, LanguageBackend, LlmEvent, ToolSchema};
pub use tool::{Tool, ToolOutcome, ToolRegistry};

/// The full generative stack handed to a response generator. TTS, ASR and
/// embeddings are optional — a text-only deployment simply leaves them out.
#[derive(Clone)]
pub struct Backends {
    pub llm: Arc<dyn LanguageBackend>,
    pub tts: Option<Arc<dyn tts::SpeechBackend>>,
    pub asr: Option<Arc<dyn asr::TranscriptionBackend>>,
    pub embedding: Option<Arc<dyn embedding::EmbeddingBackend>>,
    pub tools: Arc<ToolRegistry>,
}
