//! Client ↔ server wire protocol: JSON frames over a WebSocket, except for
//! chapter content which streams as raw text frames.

use serde::{Deserialize, Serialize};

/// Sentinel choices that drive the session rather than the story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentinel {
    Start,
    RevealSummary,
}

/// The `choice` field of an inbound frame.
///
/// Untagged: an integer is a lesson answer, an object is a narrative choice,
/// a known string is a sentinel. Variant order matters for deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChoiceEvent {
    LessonAnswer(usize),
    Narrative { chosen_path: String, choice_text: String },
    Sentinel(Sentinel),
}

/// Inbound client frame.
///
/// Legacy clients attach a full state snapshot alongside `start`. The
/// snapshot is advisory only and is never trusted over the persisted copy;
/// it is parsed here solely so those frames do not fail as protocol errors.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub state: Option<serde_json::Value>,
    pub choice: ChoiceEvent,
}

/// One selectable option as rendered by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireChoice {
    pub text: String,
    pub id: String,
}

/// Outbound JSON frames. Chapter content chunks are not represented here;
/// they travel as raw text frames (see [`OutboundMessage::Text`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ChapterUpdate {
        current_chapter: u32,
        total_chapters: u32,
    },
    /// Authoritative cleaned chapter text, replacing whatever streamed live
    /// (choice markers stripped, formatting repaired).
    ReplaceContent {
        content: String,
    },
    Choices {
        choices: Vec<WireChoice>,
    },
    Image {
        chapter: u32,
        bytes_base64: String,
    },
    SummaryReady {
        state_id: String,
    },
    Error {
        kind: String,
        message: String,
    },
}

/// What the engine hands the gateway for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Raw chapter-content fragment, relayed as a WebSocket text frame as-is.
    Text(String),
    /// JSON-encoded control frame.
    Frame(ServerFrame),
}
