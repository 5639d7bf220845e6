use super::{
    DEFAULT_BASE_URL, GenerateContentRequest, GenerateContentResponse, is_transient_status,
};
use crate::retry::Backoff;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tale_core::{Prompt, Result, TaleError, TextGenerator, TextStream};

/// Streaming text generation over the Gemini REST API.
///
/// `stream_chapter` uses `streamGenerateContent?alt=sse`; `complete_json`
/// uses the non-streaming `generateContent` endpoint. Both retry transient
/// failures with the shared text backoff schedule before surfacing
/// [`TaleError::TextGeneration`].
pub struct GeminiTextGenerator {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl GeminiTextGenerator {
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
            .map_err(|e| TaleError::TextGeneration(format!("http client: {e}")))?;
        Ok(Self { http, base_url: base_url.into(), model: model.into() })
    }

    fn endpoint(&self, verb: &str) -> String {
        format!("{}/models/{}:{verb}", self.base_url, self.model)
    }

    async fn send_checked(&self, url: &str, body: &GenerateContentRequest) -> Result<reqwest::Response> {
        let mut backoff = Backoff::for_text();
        loop {
            let attempt = self.http.post(url).json(body).send().await;
            let retry_reason = match attempt {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if !is_transient_status(status) {
                        let detail = resp.text().await.unwrap_or_default();
                        return Err(TaleError::TextGeneration(format!(
                            "provider returned {status}: {detail}"
                        )));
                    }
                    format!("status {status}")
                }
                Err(e) => e.to_string(),
            };

            match backoff.next_delay() {
                Some(delay) => {
                    tracing::debug!(%retry_reason, ?delay, "retrying text generation");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(TaleError::TextGeneration(format!(
                        "retries exhausted: {retry_reason}"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl TextGenerator for GeminiTextGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream_chapter(&self, prompt: &Prompt) -> Result<TextStream> {
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let body = GenerateContentRequest::from_text(&prompt.text);
        let response = self.send_checked(&url, &body).await?;

        let stream = async_stream::stream! {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        match serde_json::from_str::<GenerateContentResponse>(&event.data) {
                            Ok(resp) => {
                                let text = resp.text();
                                if !text.is_empty() {
                                    yield Ok(text);
                                }
                            }
                            Err(e) => {
                                yield Err(TaleError::TextGeneration(format!(
                                    "malformed stream event: {e}"
                                )));
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(TaleError::TextGeneration(format!("stream error: {e}")));
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn complete_json(&self, prompt: &Prompt) -> Result<String> {
        let url = self.endpoint("generateContent");
        let body = GenerateContentRequest::from_text(&prompt.text);
        let response = self.send_checked(&url, &body).await?;
        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| TaleError::TextGeneration(format!("malformed response: {e}")))?;
        let text = parsed.text();
        if text.is_empty() {
            return Err(TaleError::TextGeneration("provider returned no candidates".into()));
        }
        Ok(text)
    }
}
