use crate::{FindActiveRequest, StateStore, StoredAdventure, UpsertRequest};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tale_core::{AdventureId, Result, TaleError};

/// Reference store: a row map behind an `RwLock`. Upserts are atomic by
/// construction (single write-lock scope); `find_active` is strongly
/// consistent here, though the trait only requires it never returns
/// completed rows.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    rows: Arc<RwLock<HashMap<AdventureId, StoredAdventure>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows held; test convenience.
    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn upsert(&self, req: UpsertRequest) -> Result<StoredAdventure> {
        let mut rows = self.rows.write().unwrap();

        if let Some(existing) = rows.get(&req.record.id) {
            if let Some(expected) = req.expected_updated_at {
                if existing.updated_at > expected {
                    return Err(TaleError::StateConflict(format!(
                        "row {} updated at {} is newer than expected {}",
                        req.record.id, existing.updated_at, expected
                    )));
                }
            }
        }

        let mut record = req.record;
        record.updated_at = Utc::now();
        rows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn fetch(&self, id: &AdventureId) -> Result<Option<StoredAdventure>> {
        Ok(self.rows.read().unwrap().get(id).cloned())
    }

    async fn find_active(&self, req: FindActiveRequest) -> Result<Option<StoredAdventure>> {
        let rows = self.rows.read().unwrap();
        let mut best: Option<&StoredAdventure> = None;

        for row in rows.values() {
            if row.is_complete {
                continue;
            }
            if row.story_category != req.story_category || row.lesson_topic != req.lesson_topic {
                continue;
            }
            let identity_match = match (&req.user_id, &req.client_uuid) {
                (Some(user), _) if row.user_id.as_ref() == Some(user) => true,
                (_, Some(client)) if row.client_uuid.as_ref() == Some(client) => true,
                _ => false,
            };
            if !identity_match {
                continue;
            }
            if best.map(|b| row.updated_at > b.updated_at).unwrap_or(true) {
                best = Some(row);
            }
        }

        Ok(best.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tale_core::{AdventureState, ClientId, adventure};

    fn record(client: &str) -> StoredAdventure {
        let mut state = AdventureState::new(
            "enchanted_forest",
            "Human Body",
            adventure::fallback_plan(10),
            "a curious explorer",
        );
        state.client_uuid = Some(ClientId::new(client));
        StoredAdventure::from_state(AdventureId::generate(), &state, "test", false)
    }

    #[tokio::test]
    async fn upsert_then_fetch_round_trips() {
        let store = InMemoryStateStore::new();
        let record = record("c-1");
        let stored =
            store.upsert(UpsertRequest { record: record.clone(), expected_updated_at: None }).await.unwrap();
        let fetched = store.fetch(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, stored.id);
        assert_eq!(fetched.state_data, record.state_data);
    }

    #[tokio::test]
    async fn stale_upsert_conflicts() {
        let store = InMemoryStateStore::new();
        let record = record("c-1");
        let first =
            store.upsert(UpsertRequest { record: record.clone(), expected_updated_at: None }).await.unwrap();

        // A second writer wins the race.
        store
            .upsert(UpsertRequest { record: record.clone(), expected_updated_at: Some(first.updated_at) })
            .await
            .unwrap();

        // The first writer's snapshot is now stale.
        let err = store
            .upsert(UpsertRequest { record, expected_updated_at: Some(first.updated_at) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "StateConflict");
    }

    #[tokio::test]
    async fn find_active_skips_completed_and_prefers_recent() {
        let store = InMemoryStateStore::new();

        let mut done = record("c-1");
        done.is_complete = true;
        store.upsert(UpsertRequest { record: done, expected_updated_at: None }).await.unwrap();

        let older = record("c-1");
        store.upsert(UpsertRequest { record: older, expected_updated_at: None }).await.unwrap();
        let newer = record("c-1");
        let newer_stored =
            store.upsert(UpsertRequest { record: newer, expected_updated_at: None }).await.unwrap();

        let found = store
            .find_active(FindActiveRequest {
                user_id: None,
                client_uuid: Some(ClientId::new("c-1")),
                story_category: "enchanted_forest".into(),
                lesson_topic: "Human Body".into(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer_stored.id);
    }

    #[tokio::test]
    async fn find_active_requires_matching_selection() {
        let store = InMemoryStateStore::new();
        store.upsert(UpsertRequest { record: record("c-1"), expected_updated_at: None }).await.unwrap();

        let found = store
            .find_active(FindActiveRequest {
                user_id: None,
                client_uuid: Some(ClientId::new("c-1")),
                story_category: "ocean_voyage".into(),
                lesson_topic: "Human Body".into(),
            })
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
