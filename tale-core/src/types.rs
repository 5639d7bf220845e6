use derive_more::{AsRef, Deref, Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a persisted adventure, assigned on first upsert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From, AsRef, Deref, Into, Serialize, Deserialize,
)]
pub struct AdventureId(Uuid);

impl AdventureId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

/// Opaque client-supplied identifier used for anonymous-session reattachment.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, From, AsRef, Deref, Into, Serialize, Deserialize, Default,
)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Authenticated user identity produced by the injected token verifier.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, From, AsRef, Deref, Into, Serialize, Deserialize, Default,
)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}
