use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaleError>;

/// Errors surfaced by the adventure engine and its collaborators.
///
/// Adapter crates map their provider-specific failures into these variants at
/// the seam; the engine decides per variant whether to retry, degrade, or
/// surface an `error` frame to the client (see [`TaleError::kind`] for the
/// wire name).
#[derive(Debug, Error)]
pub enum TaleError {
    /// Malformed selection parameters or a story length out of bounds.
    /// Fatal for the session.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A protected connect attempt carried no token.
    #[error("authentication required")]
    AuthRequired,

    /// Token verification failed.
    #[error("authentication invalid: {0}")]
    AuthInvalid(String),

    /// Text generation failed after retries were exhausted. The session stays
    /// alive so the client can re-issue its last choice.
    #[error("text generation failed: {0}")]
    TextGeneration(String),

    /// Image generation failed after retries were exhausted. Non-fatal; the
    /// affected chapter simply has no image frame.
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    /// The state store rejected or failed an operation.
    #[error("state store: {0}")]
    Store(String),

    /// A loaded record failed validation and was reconstructed from defaults.
    #[error("state corrupted: {0}")]
    StateCorrupted(String),

    /// An upsert detected a newer persisted row.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Unknown frame or an impossible transition requested by the client.
    #[error("client protocol error: {0}")]
    Protocol(String),

    /// The question catalog could not serve a request.
    #[error("question source: {0}")]
    Question(String),

    /// The owning session was cancelled while the task was in flight.
    #[error("task cancelled")]
    Cancelled,

    /// A task exceeded its wall-clock cap.
    #[error("{task} timed out after {seconds}s")]
    Timeout { task: String, seconds: u64 },
}

impl TaleError {
    /// Stable kind tag carried in the wire `error` frame.
    pub fn kind(&self) -> &'static str {
        match self {
            TaleError::InvalidConfiguration(_) => "InvalidConfiguration",
            TaleError::AuthRequired => "AuthRequired",
            TaleError::AuthInvalid(_) => "AuthInvalid",
            TaleError::TextGeneration(_) => "TextGenerationFailed",
            TaleError::ImageUnavailable(_) => "ImageUnavailable",
            TaleError::Store(_) => "StateStoreFailed",
            TaleError::StateCorrupted(_) => "StateCorrupted",
            TaleError::StateConflict(_) => "StateConflict",
            TaleError::Protocol(_) => "ClientProtocolError",
            TaleError::Question(_) => "QuestionSourceFailed",
            TaleError::Cancelled => "Cancelled",
            TaleError::Timeout { .. } => "Timeout",
        }
    }

    /// True for errors that end the session outright.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TaleError::InvalidConfiguration(_) | TaleError::AuthRequired | TaleError::AuthInvalid(_)
        )
    }
}
