use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::RwLock;

use tallybot_core::domain::poll::{PollId, PollRecord};

use super::{PollMap, PollStore, StoreError};

/// In-process poll store. Writes can be made to fail to exercise the
/// "log and skip" paths of callers.
#[derive(Default)]
pub struct InMemoryPollStore {
    polls: RwLock<PollMap>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryPollStore {
    pub fn with_polls(polls: PollMap) -> Self {
        Self { polls: RwLock::new(polls), ..Self::default() }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: PathBuf::from("<memory>"),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "writes disabled"),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PollStore for InMemoryPollStore {
    async fn load(&self) -> Result<PollMap, StoreError> {
        Ok(self.polls.read().await.clone())
    }

    async fn save(&self, polls: &PollMap) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut current = self.polls.write().await;
        *current = polls.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: &PollId) -> Result<Option<PollRecord>, StoreError> {
        Ok(self.polls.read().await.get(id).cloned())
    }

    async fn upsert(&self, record: PollRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut polls = self.polls.write().await;
        polls.insert(record.id.clone(), record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
