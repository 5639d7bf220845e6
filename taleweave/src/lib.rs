//! Taleweave: an interactive-storytelling server that composes AI-generated
//! narrative chapters into a ten-chapter learning adventure, streamed to the
//! browser over a WebSocket.
//!
//! This facade crate re-exports the member crates; pick components with
//! feature flags (`standard` is the default).
//!
//! ```rust,ignore
//! use taleweave::prelude::*;
//!
//! let plan = taleweave::planner::plan(10, available_questions)?;
//! ```

pub use tale_core as core;

#[cfg(feature = "engine")]
pub use tale_engine as engine;
#[cfg(feature = "model")]
pub use tale_model as model;
#[cfg(feature = "planner")]
pub use tale_planner as planner;
#[cfg(feature = "prompt")]
pub use tale_prompt as prompt;
#[cfg(feature = "server")]
pub use tale_server as server;
#[cfg(feature = "session")]
pub use tale_session as session;
#[cfg(feature = "telemetry")]
pub use tale_telemetry as telemetry;

/// The types most integrations need.
pub mod prelude {
    pub use tale_core::{
        AdventureState, Chapter, ChapterType, ImageGenerator, Prompt, Result, StorytellingPhase,
        TaleError, TextGenerator, TokenVerifier,
    };

    #[cfg(feature = "engine")]
    pub use tale_engine::{EngineConfig, EngineDeps, SessionEngine, SessionParams, TaskScheduler};

    #[cfg(feature = "session")]
    pub use tale_session::{InMemoryStateStore, QuestionSource, StateStore};

    #[cfg(feature = "telemetry")]
    pub use tale_telemetry::{TelemetryEvent, TelemetrySink};
}
