//! Core types and capability traits for the Taleweave adventure engine.
//!
//! Everything the engine composes is expressed here as data
//! ([`AdventureState`], [`Chapter`], the wire frames) or as an injected
//! capability ([`TextGenerator`], [`ImageGenerator`], [`TokenVerifier`]).
//! Implementations live in the sibling crates; this crate has no I/O of its
//! own.

pub mod adventure;
pub mod error;
pub mod generator;
pub mod types;
pub mod verifier;
pub mod wire;

pub use adventure::{
    AdventureMetadata, AdventureState, Agency, AnsweredQuestion, Chapter, ChapterResponse,
    ChapterType, LessonQuestion, StoryChoice, StorytellingPhase,
};
pub use error::{Result, TaleError};
pub use generator::{ImageGenerator, Prompt, PromptPurpose, TextGenerator, TextStream};
pub use types::{AdventureId, ClientId, UserId};
pub use verifier::TokenVerifier;
pub use wire::{ChoiceEvent, ClientFrame, OutboundMessage, Sentinel, ServerFrame, WireChoice};
