use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tale_core::{AdventureId, AdventureState, ClientId, Result, UserId};

/// One persisted adventure row (§ persistence schema): the serialized state
/// plus the queryable columns lifted out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAdventure {
    pub id: AdventureId,
    pub user_id: Option<UserId>,
    pub client_uuid: Option<ClientId>,
    pub state_data: AdventureState,
    pub story_category: String,
    pub lesson_topic: String,
    pub is_complete: bool,
    pub completed_chapter_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub environment: String,
}

impl StoredAdventure {
    /// Build a row from the live state. `is_complete` is passed explicitly
    /// rather than derived: completion is only materialized on the
    /// `reveal_summary` persist.
    pub fn from_state(
        id: AdventureId,
        state: &AdventureState,
        environment: impl Into<String>,
        is_complete: bool,
    ) -> Self {
        Self {
            id,
            user_id: state.user_id.clone(),
            client_uuid: state.client_uuid.clone(),
            state_data: state.clone(),
            story_category: state.story_category.clone(),
            lesson_topic: state.lesson_topic.clone(),
            is_complete,
            completed_chapter_count: state.completed_chapter_count(),
            created_at: state.created_at,
            updated_at: state.updated_at,
            environment: environment.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpsertRequest {
    pub record: StoredAdventure,
    /// When set, the store rejects the write with `StateConflict` if its row
    /// is newer than this timestamp. `None` skips the check (first write).
    pub expected_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct FindActiveRequest {
    pub user_id: Option<UserId>,
    pub client_uuid: Option<ClientId>,
    pub story_category: String,
    pub lesson_topic: String,
}

/// Upsert/fetch/find-active over the adventure table. Writes are atomic per
/// row; `find_active` may be eventually consistent but must never return a
/// row flagged complete.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomic write keyed by `record.id`. Returns the row as stored, with
    /// the store-authoritative `updated_at`.
    async fn upsert(&self, req: UpsertRequest) -> Result<StoredAdventure>;

    async fn fetch(&self, id: &AdventureId) -> Result<Option<StoredAdventure>>;

    /// Most recently updated incomplete adventure matching the identity
    /// (user id or client uuid) and the `(story_category, lesson_topic)`
    /// selection.
    async fn find_active(&self, req: FindActiveRequest) -> Result<Option<StoredAdventure>>;
}
