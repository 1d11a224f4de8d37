//! JSON file backend for the poll store.
//!
//! The mapping is read and written wholesale. Writes go to a sibling temp
//! file that is synced and then renamed over the target, so a reader sees
//! either the previous or the next mapping, never a partial one. A single
//! async mutex serializes every write path.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use tallybot_core::domain::poll::{PollId, PollRecord};

use super::{PollMap, PollStore, StoreError};

pub struct JsonFilePollStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFilePollStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name =
            self.path.file_name().map(OsString::from).unwrap_or_else(|| OsString::from("polls"));
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io { path: self.path.clone(), source }
    }

    async fn read_map(&self) -> Result<PollMap, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(PollMap::new()),
            Err(error) => return Err(self.io_error(error)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(PollMap::new());
        }

        serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::Decode { path: self.path.clone(), source })
    }

    async fn write_map(&self, polls: &PollMap) -> Result<(), StoreError> {
        let mut bytes = serde_json::to_vec_pretty(polls).map_err(StoreError::Encode)?;
        bytes.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|error| self.io_error(error))?;
        }

        let temp_path = self.temp_path();
        {
            let mut file =
                tokio::fs::File::create(&temp_path).await.map_err(|error| self.io_error(error))?;
            file.write_all(&bytes).await.map_err(|error| self.io_error(error))?;
            file.sync_all().await.map_err(|error| self.io_error(error))?;
        }
        tokio::fs::rename(&temp_path, &self.path).await.map_err(|error| self.io_error(error))?;

        debug!(
            event_name = "poll.store.saved",
            path = %self.path.display(),
            poll_count = polls.len(),
            "poll store rewritten"
        );
        Ok(())
    }
}

#[async_trait]
impl PollStore for JsonFilePollStore {
    async fn load(&self) -> Result<PollMap, StoreError> {
        self.read_map().await
    }

    async fn save(&self, polls: &PollMap) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_map(polls).await
    }

    async fn get(&self, id: &PollId) -> Result<Option<PollRecord>, StoreError> {
        let mut polls = self.read_map().await?;
        Ok(polls.remove(id))
    }

    async fn upsert(&self, record: PollRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut polls = self.read_map().await?;
        polls.insert(record.id.clone(), record);
        self.write_map(&polls).await
    }
}
