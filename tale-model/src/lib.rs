//! Generation adapters: Gemini REST implementations of the core
//! [`tale_core::TextGenerator`] and [`tale_core::ImageGenerator`] traits,
//! shared retry/backoff, and the paragraph-formatting quality gate.

pub mod format;
pub mod gemini;
pub mod retry;

pub use format::{QualityGate, insert_paragraph_breaks, needs_paragraph_repair};
pub use gemini::{GeminiImageGenerator, GeminiTextGenerator};
pub use retry::Backoff;
