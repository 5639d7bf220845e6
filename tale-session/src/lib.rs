//! Persistence for adventures and sourcing for lesson questions.
//!
//! [`StateStore`] is the only cross-session shared resource in the system;
//! writes are atomic upserts keyed by adventure id. The in-memory
//! implementation is the reference; the trait is the seam for real backends.

pub mod inmemory;
pub mod questions;
pub mod store;

pub use inmemory::InMemoryStateStore;
pub use questions::{CatalogQuestionSource, QuestionSource};
pub use store::{FindActiveRequest, StateStore, StoredAdventure, UpsertRequest};
