use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tale_core::{AdventureId, ChapterType, UserId};

/// One recorded event. Every event carries the adventure/user identity, the
/// deployment environment tag, and a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub adventure_id: Option<AdventureId>,
    pub user_id: Option<UserId>,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TelemetryEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEventKind {
    AdventureStarted,
    ChapterViewed { chapter_number: u32, chapter_type: ChapterType, duration_ms: u64 },
    ChoiceMade { chapter_number: u32, choice: String },
    SummaryViewed,
    PlannerWarning { message: String },
    BackgroundTaskFailed { task: String, message: String },
    StateRepaired { repairs: Vec<String> },
}

impl TelemetryEvent {
    pub fn new(
        kind: TelemetryEventKind,
        adventure_id: Option<AdventureId>,
        user_id: Option<UserId>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            adventure_id,
            user_id,
            environment: environment.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Append-only event recorder. Fire-and-forget from the caller's viewpoint:
/// `record` must not block on downstream delivery and must never fail the
/// caller.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Sink that writes each event as a structured tracing line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn record(&self, event: TelemetryEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(target: "taleweave::telemetry", %payload, "event"),
            Err(error) => tracing::warn!(%error, "unserializable telemetry event"),
        }
    }
}

/// Sink that buffers events in memory; the test double for every scenario
/// that asserts on emission.
#[derive(Debug, Clone, Default)]
pub struct MemoryTelemetrySink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_where(&self, predicate: impl Fn(&TelemetryEventKind) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(&e.kind)).count()
    }
}

impl TelemetrySink for MemoryTelemetrySink {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}
