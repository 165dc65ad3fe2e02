//! Storage backends for checkpoint records.

use crate::utils::{compact_timestamp, now_utc};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Raw byte storage for checkpoint envelopes, keyed by run id.
///
/// Implementations must make `save_raw` atomic: a concurrent or later
/// reader sees either the previous record or the new one, never a mix.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Reads the record for `run_id`, or `None` if there is none.
    async fn load_raw(&self, run_id: &str) -> io::Result<Option<Vec<u8>>>;

    /// Atomically replaces the record for `run_id`.
    async fn save_raw(&self, run_id: &str, bytes: &[u8]) -> io::Result<()>;

    /// Moves the record for `run_id` aside without deleting it.
    ///
    /// Returns where it was moved, or `None` if there was no record.
    async fn quarantine(&self, run_id: &str) -> io::Result<Option<String>>;

    /// Lists run ids with a record.
    async fn list(&self) -> io::Result<Vec<String>>;

    /// Human-readable location of the record for `run_id`.
    fn location(&self, run_id: &str) -> String;
}

/// Stores one `<run_id>.json` file per run in a directory.
///
/// Writes go to `<run_id>.json.tmp`, are flushed to disk and then renamed
/// over the previous record.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the checkpoint directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn temp_path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json.tmp"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load_raw(&self, run_id: &str) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(run_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save_raw(&self, run_id: &str, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let temp_path = self.temp_path_for(run_id);
        let final_path = self.path_for(run_id);

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &final_path).await?;

        // Persist the rename itself.
        #[cfg(unix)]
        {
            if let Err(e) = sync_dir(&self.dir).await {
                tracing::warn!(
                    run_id,
                    dir = %self.dir.display(),
                    error = %e,
                    "Checkpoint directory sync failed"
                );
            }
        }

        tracing::trace!(run_id, path = %final_path.display(), bytes = bytes.len(), "Checkpoint written");
        Ok(())
    }

    async fn quarantine(&self, run_id: &str) -> io::Result<Option<String>> {
        let path = self.path_for(run_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let target = self
            .dir
            .join(format!("{run_id}.json.corrupt-{}", compact_timestamp(&now_utc())));
        tokio::fs::rename(&path, &target).await?;
        Ok(Some(target.display().to_string()))
    }

    async fn list(&self) -> io::Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut run_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(run_id) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                run_ids.push(run_id.to_string());
            }
        }
        run_ids.sort();
        Ok(run_ids)
    }

    fn location(&self, run_id: &str) -> String {
        self.path_for(run_id).display().to_string()
    }
}

/// In-memory checkpoint store for tests.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
    quarantined: Mutex<Vec<(String, Vec<u8>)>>,
}

impl InMemoryCheckpointStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the raw record for a run, bypassing encoding.
    pub fn put_raw(&self, run_id: &str, bytes: impl Into<Vec<u8>>) {
        self.records.lock().insert(run_id.to_string(), bytes.into());
    }

    /// Returns the raw record for a run.
    #[must_use]
    pub fn get_raw(&self, run_id: &str) -> Option<Vec<u8>> {
        self.records.lock().get(run_id).cloned()
    }

    /// Number of records moved aside.
    #[must_use]
    pub fn quarantined_count(&self) -> usize {
        self.quarantined.lock().len()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load_raw(&self, run_id: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.get_raw(run_id))
    }

    async fn save_raw(&self, run_id: &str, bytes: &[u8]) -> io::Result<()> {
        self.put_raw(run_id, bytes);
        Ok(())
    }

    async fn quarantine(&self, run_id: &str) -> io::Result<Option<String>> {
        let Some(bytes) = self.records.lock().remove(run_id) else {
            return Ok(None);
        };
        let mut quarantined = self.quarantined.lock();
        quarantined.push((run_id.to_string(), bytes));
        Ok(Some(format!("memory://{run_id}/corrupt-{}", quarantined.len())))
    }

    async fn list(&self) -> io::Result<Vec<String>> {
        let mut run_ids: Vec<String> = self.records.lock().keys().cloned().collect();
        run_ids.sort();
        Ok(run_ids)
    }

    fn location(&self, run_id: &str) -> String {
        format!("memory://{run_id}")
    }
}

/// Flushes directory metadata, making a completed rename durable.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}
