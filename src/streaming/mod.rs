pub mod decoder;
pub mod openai;
pub mod sse;
pub mod translator;

pub use decoder::{Frame, FrameDecoder};
pub use openai::OpenAiEncoder;
pub use sse::SseEncoder;
pub use translator::{EventTranslator, IncompleteToolCall, StreamEvent};
