use serde::Serialize;

/// Startup configuration for the gateway and the engines it spawns.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Chapters per adventure when the client does not specify.
    pub story_length_default: u32,
    /// Artificial inter-chunk delay pacing the live stream.
    pub word_delay_ms: u64,
    /// Additional delay between paragraphs.
    pub paragraph_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_cap_ms: u64,
    /// Provider model identifiers.
    pub text_model: String,
    pub image_model: String,
    /// Tag written to every persisted row and telemetry event.
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            story_length_default: 10,
            word_delay_ms: 15,
            paragraph_delay_ms: 50,
            max_reconnect_attempts: 5,
            reconnect_backoff_base_ms: 1000,
            reconnect_backoff_cap_ms: 30_000,
            text_model: "gemini-2.5-flash".to_string(),
            image_model: "imagen-3.0-generate-002".to_string(),
            environment: "development".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    ///
    /// Supported variables: `TALEWEAVE_BIND_ADDR`, `TALEWEAVE_STORY_LENGTH`,
    /// `TALEWEAVE_WORD_DELAY_MS`, `TALEWEAVE_PARAGRAPH_DELAY_MS`,
    /// `TALEWEAVE_TEXT_MODEL`, `TALEWEAVE_IMAGE_MODEL`,
    /// `TALEWEAVE_ENVIRONMENT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("TALEWEAVE_BIND_ADDR", defaults.bind_addr),
            story_length_default: env_parsed("TALEWEAVE_STORY_LENGTH", defaults.story_length_default),
            word_delay_ms: env_parsed("TALEWEAVE_WORD_DELAY_MS", defaults.word_delay_ms),
            paragraph_delay_ms: env_parsed(
                "TALEWEAVE_PARAGRAPH_DELAY_MS",
                defaults.paragraph_delay_ms,
            ),
            max_reconnect_attempts: env_parsed(
                "TALEWEAVE_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            reconnect_backoff_base_ms: env_parsed(
                "TALEWEAVE_RECONNECT_BACKOFF_BASE_MS",
                defaults.reconnect_backoff_base_ms,
            ),
            reconnect_backoff_cap_ms: env_parsed(
                "TALEWEAVE_RECONNECT_BACKOFF_CAP_MS",
                defaults.reconnect_backoff_cap_ms,
            ),
            text_model: env_or("TALEWEAVE_TEXT_MODEL", defaults.text_model),
            image_model: env_or("TALEWEAVE_IMAGE_MODEL", defaults.image_model),
            environment: env_or("TALEWEAVE_ENVIRONMENT", defaults.environment),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Reconnect policy served to clients so their retry loop matches ours.
#[derive(Debug, Clone, Serialize)]
pub struct ClientConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_cap_ms: u64,
}

impl From<&ServerConfig> for ClientConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_backoff_base_ms: config.reconnect_backoff_base_ms,
            reconnect_backoff_cap_ms: config.reconnect_backoff_cap_ms,
        }
    }
}
