//! The per-connection state machine.
//!
//! One engine instance owns one [`AdventureState`]. Inbound client frames
//! arrive on an mpsc channel (frames sent during streaming simply queue up
//! and are applied afterwards); outbound traffic leaves through
//! [`OutboundMessage`]. Background tasks never touch state: they send
//! [`StateUpdate`] messages that the engine merges between transitions.

use crate::scheduler::TaskScheduler;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tale_core::{
    AdventureId, AdventureState, Chapter, ChapterResponse, ChapterType, ChoiceEvent, ClientFrame,
    ClientId, ImageGenerator, LessonQuestion, OutboundMessage, Prompt, Result, Sentinel,
    ServerFrame, StoryChoice, TaleError, TextGenerator, TextStream, UserId, WireChoice, adventure,
};
use tale_model::QualityGate;
use tale_prompt::{
    agency_from_choice, compose_chapter, compose_character_visual_update, compose_image_scene,
    compose_image_synthesis_for, compose_summary, parse_choice_block, parse_summary_response,
    parse_visual_update,
};
use tale_session::{QuestionSource, StateStore, StoredAdventure, UpsertRequest};
use tale_telemetry::{TelemetryEvent, TelemetryEventKind, TelemetrySink};
use tokio::sync::mpsc;

/// Stand-in choices when a STORY/REFLECT stream yields fewer than three
/// parseable options; the chapter must still offer exactly three paths.
const FALLBACK_CHOICES: [&str; 3] =
    ["Press onward", "Stop and look closer", "Choose a different way"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    AwaitingSelection,
    Generating(u32),
    Streaming(u32),
    AwaitingChoice(u32),
    Concluded,
    SummaryRequested,
    Terminal,
}

/// Runtime knobs; see the server configuration for the environment defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub word_delay: Duration,
    pub paragraph_delay: Duration,
    pub environment: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            word_delay: Duration::from_millis(15),
            paragraph_delay: Duration::from_millis(50),
            environment: "development".to_string(),
        }
    }
}

/// Injected collaborators.
#[derive(Clone)]
pub struct EngineDeps {
    pub text: Arc<dyn TextGenerator>,
    pub images: Arc<dyn ImageGenerator>,
    pub store: Arc<dyn StateStore>,
    pub questions: Arc<dyn QuestionSource>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// Selection inputs for a fresh adventure.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub story_category: String,
    pub lesson_topic: String,
    pub client_uuid: Option<ClientId>,
    pub user_id: Option<UserId>,
    pub story_length: u32,
}

/// Messages background tasks send into the engine's serialized update
/// channel. The merge side is synchronous and does no I/O.
#[derive(Debug)]
enum StateUpdate {
    Summary { chapter_number: u32, title: String, summary: String },
    SummaryFailed { chapter_number: u32, message: String },
    Visuals { delta: BTreeMap<String, String> },
    VisualsFailed { message: String },
}

enum Wake {
    Update(StateUpdate),
    Frame(Option<ClientFrame>),
    Cancelled,
}

pub struct SessionEngine {
    deps: EngineDeps,
    config: EngineConfig,
    scheduler: Arc<TaskScheduler>,
    outbound: mpsc::Sender<OutboundMessage>,
    updates_tx: mpsc::UnboundedSender<StateUpdate>,
    updates_rx: mpsc::UnboundedReceiver<StateUpdate>,
    state: AdventureState,
    machine: EngineState,
    store_revision: Option<chrono::DateTime<chrono::Utc>>,
    used_questions: Vec<String>,
    suppress_start_once: bool,
    needs_replay: bool,
    regenerate_pending: Option<u32>,
    revealed: bool,
}

impl SessionEngine {
    /// Build the engine for a brand-new adventure: plan the chapter sequence,
    /// pick a protagonist, and wait for the client's `start`.
    pub async fn start_new(
        deps: EngineDeps,
        config: EngineConfig,
        scheduler: Arc<TaskScheduler>,
        outbound: mpsc::Sender<OutboundMessage>,
        params: SessionParams,
    ) -> Result<Self> {
        let available = deps.questions.available(&params.lesson_topic).await?;
        let plan = tale_planner::plan(params.story_length, available)?;

        let protagonist = pick_protagonist();
        let mut state = AdventureState::new(
            params.story_category,
            params.lesson_topic,
            plan.chapter_types,
            protagonist,
        );
        state.client_uuid = params.client_uuid;
        state.user_id = params.user_id;

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let engine = Self {
            deps,
            config,
            scheduler,
            outbound,
            updates_tx,
            updates_rx,
            state,
            machine: EngineState::AwaitingSelection,
            store_revision: None,
            used_questions: Vec::new(),
            suppress_start_once: false,
            needs_replay: false,
            regenerate_pending: None,
            revealed: false,
        };

        for warning in &plan.warnings {
            engine.emit_telemetry(TelemetryEventKind::PlannerWarning { message: warning.to_string() });
        }

        Ok(engine)
    }

    /// Rebuild the engine from a persisted row. The stored copy is
    /// authoritative; client-sent snapshots are never consulted.
    pub fn resume_from(
        deps: EngineDeps,
        config: EngineConfig,
        scheduler: Arc<TaskScheduler>,
        outbound: mpsc::Sender<OutboundMessage>,
        stored: StoredAdventure,
    ) -> Self {
        let mut state = stored.state_data;
        state.adventure_id = Some(stored.id);

        let repairs = state.sanitize();

        let used_questions: Vec<String> = state
            .chapters
            .iter()
            .filter_map(|c| c.question.as_ref())
            .map(|q| q.question.clone())
            .collect();

        let (machine, needs_replay, suppress_start_once) = match state.chapters.last() {
            Some(last) if last.chapter_type == ChapterType::Conclusion => {
                (EngineState::Concluded, false, true)
            }
            Some(last) if last.response.is_none() => {
                (EngineState::AwaitingChoice(last.chapter_number), true, true)
            }
            Some(last) => (EngineState::Generating(last.chapter_number + 1), false, true),
            None => (EngineState::AwaitingSelection, false, false),
        };

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let engine = Self {
            deps,
            config,
            scheduler,
            outbound,
            updates_tx,
            updates_rx,
            state,
            machine,
            store_revision: Some(stored.updated_at),
            used_questions,
            suppress_start_once,
            needs_replay,
            regenerate_pending: None,
            revealed: false,
        };

        if !repairs.is_empty() {
            tracing::warn!(?repairs, "loaded state required repair");
            engine.emit_telemetry(TelemetryEventKind::StateRepaired { repairs });
        }

        engine
    }

    /// Drive the session until the adventure terminates or the client goes
    /// away. Consumes the engine.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientFrame>) {
        if self.needs_replay {
            self.replay_incomplete_chapter().await;
        }

        loop {
            if let EngineState::Generating(n) = self.machine {
                if let Err(error) = self.generate_chapter(n).await {
                    self.handle_generation_failure(n, error).await;
                }
                continue;
            }
            if self.machine == EngineState::Terminal {
                break;
            }

            let wake = {
                let cancel = self.scheduler.cancellation_token();
                tokio::select! {
                    biased;
                    Some(update) = self.updates_rx.recv() => Wake::Update(update),
                    frame = inbound.recv() => Wake::Frame(frame),
                    _ = cancel.cancelled() => Wake::Cancelled,
                }
            };

            match wake {
                Wake::Update(update) => self.apply_update(update),
                Wake::Frame(Some(frame)) => self.handle_frame(frame).await,
                Wake::Frame(None) => {
                    tracing::debug!("client channel closed");
                    break;
                }
                Wake::Cancelled => {
                    tracing::debug!("session cancelled");
                    break;
                }
            }
        }

        self.finalize().await;
    }

    // ---- inbound ---------------------------------------------------------

    async fn handle_frame(&mut self, frame: ClientFrame) {
        // One-shot suppression: a client that reconnects mid-adventure sends
        // `start` out of habit; the replayed chapter already told it where it
        // is.
        if matches!(frame.choice, ChoiceEvent::Sentinel(Sentinel::Start)) && self.suppress_start_once
        {
            self.suppress_start_once = false;
            tracing::debug!("suppressed start after resume");
            return;
        }

        // A failed generation waits for any re-issued choice to retry.
        if let Some(n) = self.regenerate_pending.take() {
            self.machine = EngineState::Generating(n);
            return;
        }

        match (self.machine, frame.choice) {
            (EngineState::AwaitingSelection, ChoiceEvent::Sentinel(Sentinel::Start)) => {
                self.emit_telemetry(TelemetryEventKind::AdventureStarted);
                self.persist(false).await;
                self.machine = EngineState::Generating(1);
            }
            (EngineState::AwaitingChoice(n), ChoiceEvent::Narrative { chosen_path, choice_text }) => {
                self.handle_narrative_choice(n, chosen_path, choice_text).await;
            }
            (EngineState::AwaitingChoice(n), ChoiceEvent::LessonAnswer(index)) => {
                self.handle_lesson_answer(n, index).await;
            }
            (EngineState::Concluded, ChoiceEvent::Sentinel(Sentinel::RevealSummary)) => {
                self.reveal_summary().await;
            }
            (machine, choice) => {
                tracing::debug!(?machine, ?choice, "frame not valid in this state");
                self.send_error(&TaleError::Protocol(format!(
                    "choice not valid in state {machine:?}"
                )))
                .await;
            }
        }
    }

    async fn handle_narrative_choice(&mut self, n: u32, chosen_path: String, choice_text: String) {
        // Idempotence is keyed by chapter number: a choice whose path names an
        // already-responded earlier chapter is a duplicate, not an error.
        let target = chapter_of_path(&chosen_path).unwrap_or(n);
        if target != n {
            if self.response_recorded(target) {
                tracing::debug!(chapter = target, "duplicate narrative choice ignored");
            } else {
                self.send_error(&TaleError::Protocol(format!(
                    "choice addresses chapter {target} but chapter {n} is current"
                )))
                .await;
            }
            return;
        }

        if !matches!(
            self.chapter_type_of(n),
            Some(ChapterType::Story | ChapterType::Reflect)
        ) {
            self.send_error(&TaleError::Protocol(format!(
                "chapter {n} does not take a narrative choice"
            )))
            .await;
            return;
        }

        let recorded = self.state.record_response(
            n,
            ChapterResponse::Narrative {
                chosen_path: chosen_path.clone(),
                choice_text: choice_text.clone(),
            },
        );
        if !recorded {
            // Duplicate choice: idempotent no-op.
            tracing::debug!(chapter = n, "duplicate narrative choice ignored");
            return;
        }

        if n == 1 {
            self.state.set_agency(agency_from_choice(&choice_text));
        }

        self.emit_telemetry(TelemetryEventKind::ChoiceMade {
            chapter_number: n,
            choice: choice_text,
        });
        self.persist(false).await;
        self.machine = EngineState::Generating(n + 1);
    }

    async fn handle_lesson_answer(&mut self, n: u32, index: usize) {
        let question = match self.lesson_question_of(n) {
            Some(q) => q,
            None => {
                // An answer while a non-LESSON chapter is current is a
                // duplicate if the most recent LESSON already has a response.
                let last_lesson_answered = self
                    .state
                    .chapters
                    .iter()
                    .filter(|c| c.chapter_type == ChapterType::Lesson)
                    .next_back()
                    .map(|c| c.response.is_some())
                    .unwrap_or(false);
                if last_lesson_answered {
                    tracing::debug!(chapter = n, "duplicate lesson answer ignored");
                } else {
                    self.send_error(&TaleError::Protocol(format!(
                        "chapter {n} does not take a lesson answer"
                    )))
                    .await;
                }
                return;
            }
        };
        if index >= question.answers.len() {
            self.send_error(&TaleError::Protocol(format!(
                "answer index {index} out of range for chapter {n}"
            )))
            .await;
            return;
        }

        let is_correct = index == question.correct_index;
        let recorded =
            self.state.record_response(n, ChapterResponse::Lesson { answer_index: index, is_correct });
        if !recorded {
            tracing::debug!(chapter = n, "duplicate lesson answer ignored");
            return;
        }

        self.state.lesson_questions.push(tale_core::AnsweredQuestion {
            question: question.question.clone(),
            chosen_answer: question.answers[index].clone(),
            was_correct: is_correct,
            explanation: question.explanation.clone(),
        });

        self.emit_telemetry(TelemetryEventKind::ChoiceMade {
            chapter_number: n,
            choice: question.answers[index].clone(),
        });
        self.persist(false).await;
        self.machine = EngineState::Generating(n + 1);
    }

    // ---- generation ------------------------------------------------------

    async fn generate_chapter(&mut self, n: u32) -> Result<()> {
        let started = Instant::now();
        let idx = (n - 1) as usize;
        let total = self.state.story_length;

        let mut chapter_type = self.state.planned_chapter_types[idx];
        let mut question = None;

        if chapter_type == ChapterType::Lesson {
            match self.deps.questions.sample(&self.state.lesson_topic, &self.used_questions).await {
                Ok(Some(q)) => {
                    self.used_questions.push(q.question.clone());
                    question = Some(q);
                }
                Ok(None) => {
                    chapter_type = self.rewrite_lesson_slot(idx, "topic exhausted");
                }
                Err(error) => {
                    chapter_type = self.rewrite_lesson_slot(idx, &error.to_string());
                }
            }
        }

        let prompt = compose_chapter(&self.state, idx, question.as_ref());

        // Timing requirement: the client learns the chapter number before the
        // first token arrives.
        self.send_frame(ServerFrame::ChapterUpdate { current_chapter: n, total_chapters: total })
            .await;

        let stream = self.deps.text.stream_chapter(&prompt).await?;
        self.machine = EngineState::Streaming(n);

        let raw = self
            .scheduler
            .run_streaming(relay_stream(
                stream,
                self.outbound.clone(),
                self.config.word_delay,
                self.config.paragraph_delay,
            ))
            .await?;

        self.finish_chapter(n, chapter_type, question, prompt, raw, started).await
    }

    async fn finish_chapter(
        &mut self,
        n: u32,
        chapter_type: ChapterType,
        question: Option<LessonQuestion>,
        prompt: Prompt,
        raw: String,
        started: Instant,
    ) -> Result<()> {
        let gate = QualityGate::new(self.deps.text.as_ref());
        let repaired = match gate.repair(&prompt, &raw).await {
            Some(fixed) => fixed,
            None => raw,
        };

        let chapter = match chapter_type {
            ChapterType::Story | ChapterType::Reflect => {
                let (content, mut texts) = parse_choice_block(&repaired);
                if texts.len() < 3 {
                    tracing::warn!(chapter = n, parsed = texts.len(), "padding missing choices");
                    while texts.len() < 3 {
                        texts.push(FALLBACK_CHOICES[texts.len()].to_string());
                    }
                }
                let choices = texts
                    .into_iter()
                    .enumerate()
                    .map(|(i, text)| StoryChoice { id: format!("chapter_{n}_{i}"), text })
                    .collect();
                Chapter::narrative(n, chapter_type, content, choices)
            }
            ChapterType::Lesson => {
                let question = question.expect("lesson chapter without question");
                let mut content = repaired.trim_end().to_string();
                if !content.contains(&question.question) {
                    content.push_str("\n\n");
                    content.push_str(&question.question);
                }
                Chapter::lesson(n, content, question)
            }
            ChapterType::Conclusion => {
                // Strip any stray markers; the conclusion offers no paths.
                let (content, _) = parse_choice_block(&repaired);
                Chapter::conclusion(n, content)
            }
        };

        let content = chapter.content.clone();
        let wire_choices: Vec<WireChoice> = chapter
            .choices
            .iter()
            .map(|c| WireChoice { text: c.text.clone(), id: c.id.clone() })
            .collect();

        self.state.append_chapter(chapter)?;

        self.send_frame(ServerFrame::ReplaceContent { content: content.clone() }).await;
        if chapter_type == ChapterType::Conclusion {
            // Re-emitted after the terminal stream for correct final display.
            self.send_frame(ServerFrame::ChapterUpdate {
                current_chapter: n,
                total_chapters: self.state.story_length,
            })
            .await;
        } else {
            self.send_frame(ServerFrame::Choices { choices: wire_choices }).await;
        }

        self.persist(false).await;
        self.enqueue_summarize(n);
        self.enqueue_visual_update(content.clone());
        self.start_image_pipeline(n, content);

        self.emit_telemetry(TelemetryEventKind::ChapterViewed {
            chapter_number: n,
            chapter_type,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        self.machine = if n == self.state.story_length {
            EngineState::Concluded
        } else {
            EngineState::AwaitingChoice(n)
        };
        Ok(())
    }

    fn rewrite_lesson_slot(&mut self, idx: usize, reason: &str) -> ChapterType {
        tracing::warn!(slot = idx, reason, "LESSON slot rewritten to STORY");
        self.state.planned_chapter_types[idx] = ChapterType::Story;
        self.emit_telemetry(TelemetryEventKind::PlannerWarning {
            message: format!("LESSON slot {idx} rewritten to STORY: {reason}"),
        });
        ChapterType::Story
    }

    async fn handle_generation_failure(&mut self, n: u32, error: TaleError) {
        if matches!(error, TaleError::Cancelled) {
            self.machine = EngineState::Terminal;
            return;
        }

        tracing::warn!(chapter = n, %error, "chapter generation failed");
        self.send_error(&error).await;
        self.persist(false).await;

        // Keep the session alive: the next re-issued choice (or start, for
        // chapter 1) retries this chapter.
        self.regenerate_pending = Some(n);
        self.machine = if n <= 1 {
            EngineState::AwaitingSelection
        } else {
            EngineState::AwaitingChoice(n - 1)
        };
    }

    // ---- summary ---------------------------------------------------------

    async fn reveal_summary(&mut self) {
        self.machine = EngineState::SummaryRequested;

        // Recap artifacts must be settled before the summary page loads.
        self.scheduler.quiesce_deferred().await;
        while let Ok(update) = self.updates_rx.try_recv() {
            self.apply_update(update);
        }

        for idx in 0..self.state.chapters.len() {
            if self.state.chapter_summaries.get(idx).is_none() {
                let chapter = self.state.chapters[idx].clone();
                self.summarize_now(&chapter).await;
            }
        }

        self.revealed = true;
        self.persist(true).await;

        let state_id = self
            .state
            .adventure_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        self.send_frame(ServerFrame::SummaryReady { state_id }).await;
        self.emit_telemetry(TelemetryEventKind::SummaryViewed);
        self.machine = EngineState::Terminal;
    }

    async fn summarize_now(&mut self, chapter: &Chapter) {
        let choice_context = chapter.response.as_ref().map(response_context);
        let prompt = compose_summary(chapter, choice_context.as_deref());
        let outcome = self.deps.text.complete_json(&prompt).await;
        match outcome.ok().as_deref().and_then(parse_summary_response) {
            Some((title, summary)) => {
                self.state.record_summary(chapter.chapter_number, title, summary);
            }
            None => {
                self.state.record_summary(
                    chapter.chapter_number,
                    format!("Chapter {}", chapter.chapter_number),
                    adventure::SUMMARY_UNAVAILABLE.to_string(),
                );
            }
        }
    }

    // ---- background tasks ------------------------------------------------

    fn enqueue_summarize(&self, n: u32) {
        let Some(chapter) = self.state.chapters.iter().find(|c| c.chapter_number == n).cloned()
        else {
            return;
        };
        let text = self.deps.text.clone();
        let tx = self.updates_tx.clone();
        self.scheduler.enqueue_deferred("summarize", async move {
            let prompt = compose_summary(&chapter, None);
            let update = match text.complete_json(&prompt).await {
                Ok(response) => match parse_summary_response(&response) {
                    Some((title, summary)) => {
                        StateUpdate::Summary { chapter_number: n, title, summary }
                    }
                    None => StateUpdate::SummaryFailed {
                        chapter_number: n,
                        message: "unparseable summary response".into(),
                    },
                },
                Err(error) => {
                    StateUpdate::SummaryFailed { chapter_number: n, message: error.to_string() }
                }
            };
            let _ = tx.send(update);
        });
    }

    fn enqueue_visual_update(&self, content: String) {
        let existing = self.state.character_visuals.clone();
        let text = self.deps.text.clone();
        let tx = self.updates_tx.clone();
        self.scheduler.enqueue_deferred("update_character_visuals", async move {
            let prompt = compose_character_visual_update(&content, &existing);
            let update = match text.complete_json(&prompt).await {
                Ok(response) => {
                    let delta = parse_visual_update(&response);
                    if delta.is_empty() {
                        tracing::debug!("visual update produced no delta");
                    }
                    StateUpdate::Visuals { delta }
                }
                Err(error) => StateUpdate::VisualsFailed { message: error.to_string() },
            };
            let _ = tx.send(update);
        });
    }

    fn start_image_pipeline(&self, n: u32, content: String) {
        let scene_prompt = compose_image_scene(&content);
        let snapshot = self.state.clone();
        let text = self.deps.text.clone();
        let images = self.deps.images.clone();
        let outbound = self.outbound.clone();
        let scheduler = self.scheduler.clone();
        let telemetry = self.deps.telemetry.clone();
        let environment = self.config.environment.clone();
        let adventure_id = self.state.adventure_id;
        let user_id = self.state.user_id.clone();

        // The two LLM stages ride the deferred lane (streaming priority);
        // only the byte generation itself runs in the image lane.
        self.scheduler.enqueue_deferred("image_prompts", async move {
            let scene = match text.complete_json(&scene_prompt).await {
                Ok(scene) => scene,
                Err(error) => {
                    record_background_failure(
                        telemetry.as_ref(),
                        adventure_id,
                        user_id,
                        &environment,
                        "image_scene",
                        &error,
                    );
                    return;
                }
            };
            let synthesis_prompt = compose_image_synthesis_for(&snapshot, &scene);
            let image_prompt = match text.complete_json(&synthesis_prompt).await {
                Ok(prompt) => prompt,
                Err(error) => {
                    record_background_failure(
                        telemetry.as_ref(),
                        adventure_id,
                        user_id,
                        &environment,
                        "image_synthesis",
                        &error,
                    );
                    return;
                }
            };

            scheduler.spawn_image("image_generate", async move {
                match images.generate(&image_prompt).await {
                    Ok(bytes) => {
                        let frame = ServerFrame::Image {
                            chapter: n,
                            bytes_base64: BASE64.encode(&bytes),
                        };
                        let _ = outbound.send(OutboundMessage::Frame(frame)).await;
                    }
                    Err(error) => {
                        // ImageUnavailable is non-fatal: no frame, no error
                        // surfaced to the client.
                        record_background_failure(
                            telemetry.as_ref(),
                            adventure_id,
                            user_id,
                            &environment,
                            "image_generate",
                            &error,
                        );
                    }
                }
            });
        });
    }

    fn apply_update(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Summary { chapter_number, title, summary } => {
                self.state.record_summary(chapter_number, title, summary);
            }
            StateUpdate::SummaryFailed { chapter_number, message } => {
                self.state.record_summary(
                    chapter_number,
                    format!("Chapter {chapter_number}"),
                    adventure::SUMMARY_UNAVAILABLE.to_string(),
                );
                self.emit_telemetry(TelemetryEventKind::BackgroundTaskFailed {
                    task: "summarize".into(),
                    message,
                });
            }
            StateUpdate::Visuals { delta } => {
                self.state.merge_character_visuals(delta);
            }
            StateUpdate::VisualsFailed { message } => {
                self.emit_telemetry(TelemetryEventKind::BackgroundTaskFailed {
                    task: "update_character_visuals".into(),
                    message,
                });
            }
        }
    }

    // ---- resume ----------------------------------------------------------

    async fn replay_incomplete_chapter(&mut self) {
        let Some(last) = self.state.chapters.last() else {
            return;
        };
        let n = last.chapter_number;
        let content = last.content.clone();
        let choices: Vec<WireChoice> = last
            .choices
            .iter()
            .map(|c| WireChoice { text: c.text.clone(), id: c.id.clone() })
            .collect();

        self.send_frame(ServerFrame::ChapterUpdate {
            current_chapter: n,
            total_chapters: self.state.story_length,
        })
        .await;
        self.send_frame(ServerFrame::ReplaceContent { content }).await;
        self.send_frame(ServerFrame::Choices { choices }).await;
    }

    // ---- persistence -----------------------------------------------------

    async fn persist(&mut self, complete: bool) {
        let id = match self.state.adventure_id {
            Some(id) => id,
            None => {
                let id = AdventureId::generate();
                self.state.adventure_id = Some(id);
                id
            }
        };

        match self.try_upsert(id, complete).await {
            Ok(()) => {}
            Err(TaleError::StateConflict(first)) => {
                // Reload the row's clock and retry exactly once; this engine
                // remains authoritative for content.
                tracing::warn!(%id, conflict = %first, "upsert conflict, reloading");
                match self.deps.store.fetch(&id).await {
                    Ok(Some(row)) => self.store_revision = Some(row.updated_at),
                    Ok(None) => self.store_revision = None,
                    Err(error) => {
                        tracing::warn!(%error, "conflict reload failed");
                        return;
                    }
                }
                if let Err(error) = self.try_upsert(id, complete).await {
                    self.send_error(&error).await;
                }
            }
            Err(error) => {
                // A store outage must not kill a live narrative; resume will
                // reconcile.
                tracing::warn!(%error, "state persist failed");
            }
        }
    }

    async fn try_upsert(&mut self, id: AdventureId, complete: bool) -> Result<()> {
        let record =
            StoredAdventure::from_state(id, &self.state, self.config.environment.as_str(), complete);
        let stored = self
            .deps
            .store
            .upsert(UpsertRequest { record, expected_updated_at: self.store_revision })
            .await?;
        self.store_revision = Some(stored.updated_at);
        Ok(())
    }

    async fn finalize(&mut self) {
        self.scheduler.cancel();
        while let Ok(update) = self.updates_rx.try_recv() {
            self.apply_update(update);
        }
        self.persist(self.revealed).await;
    }

    // ---- plumbing --------------------------------------------------------

    async fn send_frame(&mut self, frame: ServerFrame) {
        if self.outbound.send(OutboundMessage::Frame(frame)).await.is_err() {
            tracing::debug!("outbound channel closed");
            self.machine = EngineState::Terminal;
        }
    }

    async fn send_error(&mut self, error: &TaleError) {
        let frame = ServerFrame::Error { kind: error.kind().to_string(), message: error.to_string() };
        self.send_frame(frame).await;
    }

    fn emit_telemetry(&self, kind: TelemetryEventKind) {
        self.deps.telemetry.record(TelemetryEvent::new(
            kind,
            self.state.adventure_id,
            self.state.user_id.clone(),
            self.config.environment.clone(),
        ));
    }

    fn response_recorded(&self, n: u32) -> bool {
        self.state
            .chapters
            .iter()
            .find(|c| c.chapter_number == n)
            .map(|c| c.response.is_some())
            .unwrap_or(false)
    }

    fn chapter_type_of(&self, n: u32) -> Option<ChapterType> {
        self.state
            .chapters
            .iter()
            .find(|c| c.chapter_number == n)
            .map(|c| c.chapter_type)
    }

    fn lesson_question_of(&self, n: u32) -> Option<LessonQuestion> {
        self.state
            .chapters
            .iter()
            .find(|c| c.chapter_number == n)
            .and_then(|c| c.question.clone())
    }
}

/// Chapter number encoded in a `chapter_{n}_{i}` choice id.
fn chapter_of_path(path: &str) -> Option<u32> {
    let rest = path.strip_prefix("chapter_")?;
    rest.split('_').next()?.parse().ok()
}

fn pick_protagonist() -> String {
    use rand::Rng;
    let pool = tale_prompt::PROTAGONIST_POOL;
    let index = rand::rng().random_range(0..pool.len());
    pool[index].to_string()
}

fn response_context(response: &ChapterResponse) -> String {
    match response {
        ChapterResponse::Narrative { choice_text, .. } => choice_text.clone(),
        ChapterResponse::Lesson { answer_index, is_correct } => {
            format!("answer {answer_index} ({})", if *is_correct { "correct" } else { "incorrect" })
        }
    }
}

fn record_background_failure(
    telemetry: &dyn TelemetrySink,
    adventure_id: Option<AdventureId>,
    user_id: Option<UserId>,
    environment: &str,
    task: &str,
    error: &TaleError,
) {
    tracing::warn!(task, %error, "background task failed");
    telemetry.record(TelemetryEvent::new(
        TelemetryEventKind::BackgroundTaskFailed { task: task.to_string(), message: error.to_string() },
        adventure_id,
        user_id,
        environment.to_string(),
    ));
}

/// Forward stream chunks to the client as they arrive, paced word by word,
/// and return the full accumulated raw text.
async fn relay_stream(
    mut stream: TextStream,
    outbound: mpsc::Sender<OutboundMessage>,
    word_delay: Duration,
    paragraph_delay: Duration,
) -> Result<String> {
    let mut raw = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        raw.push_str(&chunk);

        for piece in split_keeping_whitespace(&chunk) {
            let is_paragraph_break = piece.contains("\n\n");
            if outbound.send(OutboundMessage::Text(piece)).await.is_err() {
                // Client gone; keep draining so state stays consistent.
                continue;
            }
            if is_paragraph_break {
                if !paragraph_delay.is_zero() {
                    tokio::time::sleep(paragraph_delay).await;
                }
            } else if !word_delay.is_zero() {
                tokio::time::sleep(word_delay).await;
            }
        }
    }
    Ok(raw)
}

/// Word-granularity pieces, each carrying its trailing whitespace, so the
/// client can concatenate them verbatim.
fn split_keeping_whitespace(chunk: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut in_whitespace = false;
    for ch in chunk.chars() {
        if ch.is_whitespace() {
            in_whitespace = true;
            current.push(ch);
        } else {
            if in_whitespace {
                pieces.push(std::mem::take(&mut current));
                in_whitespace = false;
            }
            current.push(ch);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
