//! Shared test doubles and the session harness used by the scenario tests.
#![allow(dead_code)] // not every scenario binary uses every double

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tale_core::{
    ChoiceEvent, ClientFrame, ClientId, ImageGenerator, OutboundMessage, Prompt, PromptPurpose,
    Result, Sentinel, ServerFrame, TaleError, TextGenerator, TextStream,
};
use tale_engine::{EngineConfig, EngineDeps, SchedulerConfig, SessionEngine, SessionParams, TaskScheduler};
use tale_session::{CatalogQuestionSource, InMemoryStateStore, QuestionSource, StateStore};
use tale_telemetry::MemoryTelemetrySink;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Scripted text generator: produces deterministic chapters keyed off the
/// composer's own instructions, and records enough to assert the
/// streaming-priority property.
pub struct ScriptedTextGenerator {
    /// Chapters currently streaming (between first and last chunk).
    pub streams_active: Arc<AtomicUsize>,
    /// `complete_json` calls observed while a stream was active.
    pub priority_violations: Arc<AtomicUsize>,
    pub completions: Arc<AtomicUsize>,
    /// Summaries for this chapter fail permanently (scenario: background
    /// summary failure).
    pub fail_summary_for_chapter: Option<u32>,
    /// Delay between streamed chunks, to widen the race window.
    pub chunk_delay: Duration,
}

impl Default for ScriptedTextGenerator {
    fn default() -> Self {
        Self {
            streams_active: Arc::new(AtomicUsize::new(0)),
            priority_violations: Arc::new(AtomicUsize::new(0)),
            completions: Arc::new(AtomicUsize::new(0)),
            fail_summary_for_chapter: None,
            chunk_delay: Duration::ZERO,
        }
    }
}

fn chapter_chunks(prompt: &str) -> Vec<String> {
    if prompt.contains("Do not offer any choices") {
        vec![
            "The long road bent home at last. ".to_string(),
            "\n\nEvery lesson walked beside them now, quiet and sure.".to_string(),
        ]
    } else if prompt.contains("the reader will answer directly") {
        vec![
            "At the mossy gate a keeper waited with a riddle. ".to_string(),
            "\n\nThe keeper spoke slowly, watching their eyes.".to_string(),
        ]
    } else {
        vec![
            "The path twisted deeper into the green. ".to_string(),
            "\n\nSomething bright moved between the trees.".to_string(),
            "\n\n<CHOICES>\nChoice A: Take the bridge\nChoice B: Follow the stream\nChoice C: Climb the ridge\n</CHOICES>".to_string(),
        ]
    }
}

#[async_trait]
impl TextGenerator for ScriptedTextGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chapter(&self, prompt: &Prompt) -> Result<TextStream> {
        let chunks = chapter_chunks(&prompt.text);
        let active = self.streams_active.clone();
        let delay = self.chunk_delay;
        let stream = async_stream::stream! {
            active.fetch_add(1, Ordering::SeqCst);
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(chunk);
            }
            active.fetch_sub(1, Ordering::SeqCst);
        };
        Ok(Box::pin(stream))
    }

    async fn complete_json(&self, prompt: &Prompt) -> Result<String> {
        if self.streams_active.load(Ordering::SeqCst) > 0 {
            self.priority_violations.fetch_add(1, Ordering::SeqCst);
        }
        self.completions.fetch_add(1, Ordering::SeqCst);

        match prompt.purpose {
            PromptPurpose::Summary => {
                if let Some(n) = self.fail_summary_for_chapter {
                    if prompt.text.contains(&format!("Chapter {n} content:")) {
                        return Err(TaleError::TextGeneration("summary provider down".into()));
                    }
                }
                Ok(r#"{"title": "A Turn in the Path", "summary": "The journey pressed on."}"#.into())
            }
            PromptPurpose::VisualUpdate => Ok(r#"{"Mira": "a silver-haired scout"}"#.into()),
            PromptPurpose::ImageScene => Ok("A clearing at dusk, lanterns low.".into()),
            PromptPurpose::ImageSynthesis => Ok("storybook painting of a dusk clearing".into()),
            PromptPurpose::Chapter => Ok("A reformatted chapter.\n\nWith proper breaks.".into()),
        }
    }
}

/// Generator whose streams fail immediately; for retry-path tests.
pub struct FailingTextGenerator;

#[async_trait]
impl TextGenerator for FailingTextGenerator {
    fn name(&self) -> &str {
        "failing"
    }

    async fn stream_chapter(&self, _prompt: &Prompt) -> Result<TextStream> {
        Err(TaleError::TextGeneration("provider down".into()))
    }

    async fn complete_json(&self, _prompt: &Prompt) -> Result<String> {
        Err(TaleError::TextGeneration("provider down".into()))
    }
}

pub struct FakeImageGenerator {
    pub calls: Arc<AtomicUsize>,
}

impl Default for FakeImageGenerator {
    fn default() -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)) }
    }
}

#[async_trait]
impl ImageGenerator for FakeImageGenerator {
    fn name(&self) -> &str {
        "fake-images"
    }

    async fn generate(&self, _prompt: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(b"\x89PNG fake"))
    }
}

/// Question source that over-reports availability, forcing the engine's
/// runtime LESSON-slot rewrite.
pub struct OverpromisingQuestionSource {
    pub inner: CatalogQuestionSource,
    pub claimed: usize,
}

#[async_trait]
impl QuestionSource for OverpromisingQuestionSource {
    async fn available(&self, _topic: &str) -> Result<usize> {
        Ok(self.claimed)
    }

    async fn sample(
        &self,
        topic: &str,
        exclude: &[String],
    ) -> Result<Option<tale_core::LessonQuestion>> {
        self.inner.sample(topic, exclude).await
    }
}

pub const TWO_QUESTION_CATALOG: &str = r#"{
  "topics": {
    "Tides": [
      {
        "question": "What pulls the tides?",
        "answers": ["The moon's gravity", "The wind", "Whales"],
        "correct_index": 0,
        "explanation": "Lunar gravity tugs the oceans as the Earth turns."
      },
      {
        "question": "How often do most coasts see high tide?",
        "answers": ["Once a month", "About twice a day", "Once a year"],
        "correct_index": 1,
        "explanation": "Most coasts get two high tides in roughly 25 hours."
      }
    ]
  }
}"#;

/// Everything a scenario needs to drive one session end to end.
pub struct Harness {
    pub inbound: mpsc::Sender<ClientFrame>,
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub store: Arc<InMemoryStateStore>,
    pub sink: Arc<MemoryTelemetrySink>,
    pub scheduler: Arc<TaskScheduler>,
    pub engine: tokio::task::JoinHandle<()>,
}

pub struct HarnessOptions {
    pub text: Arc<dyn TextGenerator>,
    pub questions: Arc<dyn QuestionSource>,
    pub story_length: u32,
    pub story_category: String,
    pub lesson_topic: String,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            text: Arc::new(ScriptedTextGenerator::default()),
            questions: Arc::new(CatalogQuestionSource::builtin()),
            story_length: 10,
            story_category: "enchanted_forest".into(),
            lesson_topic: "Human Body".into(),
        }
    }
}

pub async fn start_session(options: HarnessOptions) -> Harness {
    let store = Arc::new(InMemoryStateStore::new());
    start_session_with_store(options, store, None).await
}

/// Spawn an engine over the given store; `resume_client` resumes an existing
/// adventure for that client instead of starting fresh.
pub async fn start_session_with_store(
    options: HarnessOptions,
    store: Arc<InMemoryStateStore>,
    resume_client: Option<&str>,
) -> Harness {
    let sink = Arc::new(MemoryTelemetrySink::new());
    let deps = EngineDeps {
        text: options.text,
        images: Arc::new(FakeImageGenerator::default()),
        store: store.clone(),
        questions: options.questions,
        telemetry: sink.clone(),
    };
    let config = EngineConfig {
        word_delay: Duration::ZERO,
        paragraph_delay: Duration::ZERO,
        environment: "test".into(),
    };
    let scheduler = TaskScheduler::new(SchedulerConfig::default(), CancellationToken::new());

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (outbound_tx, outbound_rx) = mpsc::channel(4096);

    let engine = match resume_client {
        Some(client) => {
            let stored = store
                .find_active(tale_session::FindActiveRequest {
                    user_id: None,
                    client_uuid: Some(ClientId::new(client)),
                    story_category: options.story_category.clone(),
                    lesson_topic: options.lesson_topic.clone(),
                })
                .await
                .unwrap()
                .expect("active adventure to resume");
            SessionEngine::resume_from(deps, config, scheduler.clone(), outbound_tx, stored)
        }
        None => SessionEngine::start_new(
            deps,
            config,
            scheduler.clone(),
            outbound_tx,
            SessionParams {
                story_category: options.story_category,
                lesson_topic: options.lesson_topic,
                client_uuid: Some(ClientId::new("client-1")),
                user_id: None,
                story_length: options.story_length,
            },
        )
        .await
        .expect("engine construction"),
    };

    let handle = tokio::spawn(engine.run(inbound_rx));

    Harness {
        inbound: inbound_tx,
        outbound: outbound_rx,
        store,
        sink,
        scheduler,
        engine: handle,
    }
}

impl Harness {
    pub async fn send_start(&self) {
        self.send_choice(ChoiceEvent::Sentinel(Sentinel::Start)).await;
    }

    pub async fn send_choice(&self, choice: ChoiceEvent) {
        self.inbound.send(ClientFrame { state: None, choice }).await.expect("engine alive");
    }

    /// Next JSON frame, skipping raw text chunks.
    pub async fn next_frame(&mut self) -> ServerFrame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("frame within 5s")
                .expect("outbound open");
            if let OutboundMessage::Frame(frame) = message {
                return frame;
            }
        }
    }

    /// Collect frames until one matches; returns everything seen (text
    /// chunks included) in order.
    pub async fn frames_until(
        &mut self,
        mut stop: impl FnMut(&ServerFrame) -> bool,
    ) -> Vec<OutboundMessage> {
        let mut seen = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("frame within 5s")
                .expect("outbound open");
            let done = matches!(&message, OutboundMessage::Frame(f) if stop(f));
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    /// Drive one chapter to its choice point (or conclusion), answering with
    /// the first option when asked. Returns the frames observed.
    pub async fn advance_chapter(&mut self) -> Vec<OutboundMessage> {
        self.frames_until(|f| {
            matches!(f, ServerFrame::Choices { .. })
                || matches!(f, ServerFrame::SummaryReady { .. })
        })
        .await
    }
}

/// First `choices` frame within the batch.
pub fn choices_of(frames: &[OutboundMessage]) -> Vec<tale_core::WireChoice> {
    frames
        .iter()
        .find_map(|m| match m {
            OutboundMessage::Frame(ServerFrame::Choices { choices }) => Some(choices.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

pub fn has_error_frame(frames: &[OutboundMessage]) -> bool {
    frames
        .iter()
        .any(|m| matches!(m, OutboundMessage::Frame(ServerFrame::Error { .. })))
}
