use anyhow::Context;
use std::sync::Arc;
use tale_core::verifier::AllowAnonymous;
use tale_engine::EngineDeps;
use tale_model::{GeminiImageGenerator, GeminiTextGenerator};
use tale_server::{AppState, ServerConfig, router};
use tale_session::{CatalogQuestionSource, InMemoryStateStore};
use tale_telemetry::{TelemetryConfig, TracingTelemetrySink, init_with_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_with_config(TelemetryConfig::from_env());

    let config = Arc::new(ServerConfig::from_env());
    let api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY must be set")?;

    let questions = match std::env::var("TALEWEAVE_QUESTIONS_FILE") {
        Ok(path) => CatalogQuestionSource::from_file(&path)
            .with_context(|| format!("loading question catalog from {path}"))?,
        Err(_) => CatalogQuestionSource::builtin(),
    };

    let deps = EngineDeps {
        text: Arc::new(GeminiTextGenerator::new(&api_key, config.text_model.as_str())?),
        images: Arc::new(GeminiImageGenerator::new(&api_key, config.image_model.as_str())?),
        store: Arc::new(InMemoryStateStore::new()),
        questions: Arc::new(questions),
        telemetry: Arc::new(TracingTelemetrySink),
    };

    let state = AppState { deps, verifier: Arc::new(AllowAnonymous), config: config.clone() };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, environment = %config.environment, "taleweave listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    Ok(())
}
