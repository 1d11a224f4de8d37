use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use tallybot_core::domain::poll::{PollId, PollRecord};

pub mod file;
pub mod memory;

pub use file::JsonFilePollStore;
pub use memory::InMemoryPollStore;

/// The whole persisted state: every poll keyed by its id.
pub type PollMap = BTreeMap<PollId, PollRecord>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("poll store io failure at `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("poll store at `{path}` could not be decoded: {source}")]
    Decode { path: PathBuf, source: serde_json::Error },
    #[error("poll store encode failure: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Whole-mapping poll persistence.
///
/// `save` replaces the full mapping. `upsert` is a load-modify-save that is
/// atomic with respect to every other writer of the same store.
#[async_trait]
pub trait PollStore: Send + Sync {
    async fn load(&self) -> Result<PollMap, StoreError>;
    async fn save(&self, polls: &PollMap) -> Result<(), StoreError>;
    async fn get(&self, id: &PollId) -> Result<Option<PollRecord>, StoreError>;
    async fn upsert(&self, record: PollRecord) -> Result<(), StoreError>;
}
