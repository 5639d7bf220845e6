use super::{DEFAULT_BASE_URL, is_transient_status};
use crate::retry::Backoff;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tale_core::{ImageGenerator, Result, TaleError};

/// Per-attempt wall-clock cap.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct PredictRequest {
    instances: Vec<PredictInstance>,
    parameters: PredictParameters,
}

#[derive(Debug, Serialize)]
struct PredictInstance {
    prompt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    sample_count: u32,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    #[serde(default)]
    bytes_base64_encoded: String,
}

/// Image generation over the Gemini/Imagen predict endpoint.
///
/// Retries up to 5 attempts with exponential backoff (1 s base, 30 s cap) and
/// a 30-second per-attempt timeout. Exhaustion surfaces as
/// [`TaleError::ImageUnavailable`]; callers treat that as "no image", never
/// as a session failure.
pub struct GeminiImageGenerator {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl GeminiImageGenerator {
    pub fn new(api_key: &str, model: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        api_key: &str,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let headers = HeaderMap::from_iter([(
            HeaderName::from_static("x-goog-api-key"),
            HeaderValue::from_str(api_key)
                .map_err(|e| TaleError::InvalidConfiguration(format!("invalid API key: {e}")))?,
        )]);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| TaleError::ImageUnavailable(format!("http client: {e}")))?;
        Ok(Self { http, base_url: base_url.into(), model: model.into() })
    }

    async fn attempt(&self, prompt: &str) -> std::result::Result<Bytes, AttemptError> {
        let url = format!("{}/models/{}:predict", self.base_url, self.model);
        let body = PredictRequest {
            instances: vec![PredictInstance { prompt: prompt.to_string() }],
            parameters: PredictParameters { sample_count: 1 },
        };

        let request = self.http.post(&url).json(&body).send();
        let response = tokio::time::timeout(ATTEMPT_TIMEOUT, request)
            .await
            .map_err(|_| AttemptError::Transient("attempt timed out after 30s".into()))?
            .map_err(|e| AttemptError::Transient(format!("request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let transient = is_transient_status(status);
            let detail = response.text().await.unwrap_or_default();
            let message = format!("provider returned {status}: {detail}");
            return Err(if transient {
                AttemptError::Transient(message)
            } else {
                AttemptError::Permanent(message)
            });
        }

        let parsed: PredictResponse = tokio::time::timeout(ATTEMPT_TIMEOUT, response.json())
            .await
            .map_err(|_| AttemptError::Transient("decode timed out after 30s".into()))?
            .map_err(|e| AttemptError::Transient(format!("malformed response: {e}")))?;

        let encoded = parsed
            .predictions
            .first()
            .map(|p| p.bytes_base64_encoded.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AttemptError::Permanent("no predictions".into()))?;

        let decoded = BASE64
            .decode(encoded)
            .map_err(|e| AttemptError::Permanent(format!("bad base64: {e}")))?;
        Ok(Bytes::from(decoded))
    }
}

// Permanent failures skip the remaining retry budget.
enum AttemptError {
    Transient(String),
    Permanent(String),
}

#[async_trait]
impl ImageGenerator for GeminiImageGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<Bytes> {
        let mut backoff = Backoff::for_image();
        loop {
            match self.attempt(prompt).await {
                Ok(bytes) => return Ok(bytes),
                Err(AttemptError::Permanent(detail)) => {
                    return Err(TaleError::ImageUnavailable(detail));
                }
                Err(AttemptError::Transient(detail)) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(reason = %detail, ?delay, "retrying image generation");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(TaleError::ImageUnavailable(format!(
                            "retries exhausted: {detail}"
                        )));
                    }
                },
            }
        }
    }
}
