//! Tracing initialization and configuration

use std::sync::Once;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Configuration for process-wide tracing.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub default_level: Option<String>,
    pub log_directives: Vec<String>,
    pub json_output: bool,
}

impl TelemetryConfig {
    /// Create a new configuration with the given service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), ..Default::default() }
    }

    /// Set the default log level (e.g., "debug", "info").
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = Some(level.into());
        self
    }

    /// Add a custom tracing directive (e.g., "tale_engine=debug").
    pub fn with_log_directive(mut self, directive: impl Into<String>) -> Self {
        self.log_directives.push(directive.into());
        self
    }

    /// Emit JSON lines instead of the human-readable format.
    pub fn with_json_output(mut self) -> Self {
        self.json_output = true;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - `SERVICE_NAME`: the name of the service (default: "taleweave")
    /// - `LOG_LEVEL`: default log level (default: "info")
    /// - `LOG_FORMAT`: "json" for JSON lines
    pub fn from_env() -> Self {
        let service_name =
            std::env::var("SERVICE_NAME").unwrap_or_else(|_| "taleweave".to_string());
        let default_level = std::env::var("LOG_LEVEL").ok();
        let json_output = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

        Self { service_name, default_level, log_directives: Vec::new(), json_output }
    }
}

/// Initialize tracing with console logging under the given service name.
pub fn init_telemetry(service_name: &str) {
    init_with_config(TelemetryConfig::new(service_name));
}

/// Initialize tracing from a full configuration. Safe to call more than
/// once; only the first call installs a subscriber.
pub fn init_with_config(config: TelemetryConfig) {
    use tracing_subscriber::fmt;

    INIT.call_once(|| {
        let mut filter = EnvFilter::try_from_default_env()
            .or_else(|_| {
                let level = config.default_level.as_deref().unwrap_or("info");
                EnvFilter::try_new(level)
            })
            .expect("Failed to create env filter");

        for directive in &config.log_directives {
            filter = filter.add_directive(directive.parse().expect("Invalid log directive"));
        }

        if config.json_output {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true).with_line_number(true))
                .init();
        }

        tracing::info!(
            service.name = config.service_name,
            log.level = config.default_level.as_deref().unwrap_or("env"),
            "Telemetry initialized"
        );
    });
}
