//! Paragraph-formatting quality gate.
//!
//! Long unbroken chapter text renders badly. The gate inspects accumulated
//! text (analysis only, never the live streaming path), and when breaks are
//! missing it races up to two non-streaming regeneration attempts with
//! stronger formatting instructions, falling back to heuristic break
//! insertion if neither passes. The engine applies the result through the
//! `replace_content` frame after the stream closes.

use futures::stream::{FuturesUnordered, StreamExt};
use tale_core::{Prompt, PromptPurpose, TextGenerator};

/// Below this size no judgement is made; short text reads fine unbroken.
const MIN_ANALYSIS_BYTES: usize = 150;

/// Expected density: one blank-line break per roughly this many characters.
const CHARS_PER_BREAK: usize = 225;

/// How many concurrent regeneration attempts the gate may race.
const REGEN_ATTEMPTS: usize = 2;

/// True when `text` is long enough to judge and lacks paragraph breaks
/// proportional to its length.
pub fn needs_paragraph_repair(text: &str) -> bool {
    if text.len() < MIN_ANALYSIS_BYTES {
        return false;
    }
    let expected = text.len() / CHARS_PER_BREAK;
    if expected == 0 {
        return false;
    }
    let actual = text.matches("\n\n").count();
    actual < expected
}

/// Heuristic fallback: regroup sentences into paragraphs of roughly
/// [`CHARS_PER_BREAK`] characters. Existing breaks are preserved.
pub fn insert_paragraph_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut paragraph_len = 0usize;

    for piece in split_sentences(text) {
        if paragraph_len > 0 && paragraph_len + piece.len() > CHARS_PER_BREAK {
            out.push_str("\n\n");
            paragraph_len = 0;
        } else if paragraph_len > 0 {
            out.push(' ');
            paragraph_len += 1;
        }
        out.push_str(piece);
        paragraph_len += piece.len();
    }

    out
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        let is_terminal = matches!(b, b'.' | b'!' | b'?');
        let at_boundary = is_terminal
            && bytes.get(i + 1).map(|next| next.is_ascii_whitespace()).unwrap_or(true);
        if at_boundary {
            let sentence = text[start..=i].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = i + 1;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// The gate itself: holds the original chapter prompt so regeneration can
/// restate it with explicit formatting instructions.
pub struct QualityGate<'a> {
    generator: &'a dyn TextGenerator,
}

impl<'a> QualityGate<'a> {
    pub fn new(generator: &'a dyn TextGenerator) -> Self {
        Self { generator }
    }

    /// Return a well-formatted version of `text`, or `None` when the text
    /// already passes. Never fails: regeneration errors degrade to the
    /// heuristic fallback.
    pub async fn repair(&self, original_prompt: &Prompt, text: &str) -> Option<String> {
        if !needs_paragraph_repair(text) {
            return None;
        }

        let regen_prompt = Prompt::new(
            PromptPurpose::Chapter,
            format!(
                "{}\n\nIMPORTANT: your previous answer arrived as one unbroken block. \
                 Rewrite the chapter with a blank line between every paragraph. Keep the \
                 story, choices, and wording otherwise identical.\n\nPrevious answer:\n{}",
                original_prompt.text, text
            ),
        );

        let mut attempts: FuturesUnordered<_> = (0..REGEN_ATTEMPTS)
            .map(|_| self.generator.complete_json(&regen_prompt))
            .collect();

        while let Some(result) = attempts.next().await {
            match result {
                Ok(candidate) if !needs_paragraph_repair(&candidate) => return Some(candidate),
                Ok(_) => {}
                Err(error) => {
                    tracing::debug!(%error, "formatting regeneration attempt failed");
                }
            }
        }

        Some(insert_paragraph_breaks(text))
    }
}
