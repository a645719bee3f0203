pub mod context;
pub mod event;
pub mod generate;
pub mod segment;

pub use event::{GeneratorEvent, SentenceAudio};
pub use generate::{GenerationHandle, GeneratorSettings, ResponseGenerator};
pub use segment::SentenceSegmenter;
