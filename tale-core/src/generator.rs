use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Stream of raw text fragments as they arrive from the provider.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// What a prompt is for. Adapters may tune generation parameters per purpose;
/// test doubles use it to script responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromptPurpose {
    Chapter,
    Summary,
    VisualUpdate,
    ImageScene,
    ImageSynthesis,
}

impl std::fmt::Display for PromptPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PromptPurpose::Chapter => "chapter",
            PromptPurpose::Summary => "summary",
            PromptPurpose::VisualUpdate => "visual_update",
            PromptPurpose::ImageScene => "image_scene",
            PromptPurpose::ImageSynthesis => "image_synthesis",
        };
        f.write_str(s)
    }
}

/// A composed prompt ready to hand to a [`TextGenerator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub purpose: PromptPurpose,
    pub text: String,
}

impl Prompt {
    pub fn new(purpose: PromptPurpose, text: impl Into<String>) -> Self {
        Self { purpose, text: text.into() }
    }
}

/// Streaming and non-streaming text completion.
///
/// Implementations retry transient provider errors internally (exponential
/// backoff, base 500 ms, factor 2, max 5 attempts) and surface exhaustion as
/// [`crate::TaleError::TextGeneration`].
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Chapter content as a live token stream. The caller consumes chunks at
    /// its own pace; nothing in the adapter may hold a chunk back.
    async fn stream_chapter(&self, prompt: &Prompt) -> Result<TextStream>;

    /// Non-streaming completion used for summaries, scene extraction, visual
    /// updates, and the image-synthesis meta-prompt.
    async fn complete_json(&self, prompt: &Prompt) -> Result<String>;
}

/// Non-streaming image bytes from a prompt.
///
/// Implementations retry up to 5 times with exponential backoff (1 s base,
/// 30 s cap, 30 s per-attempt timeout) and surface exhaustion as
/// [`crate::TaleError::ImageUnavailable`], which is non-fatal for the session.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<Bytes>;
}
