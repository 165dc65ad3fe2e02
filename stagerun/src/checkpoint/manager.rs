//! Checkpoint manager: typed load/save over a [`CheckpointStore`].

use super::record::{decode, encode, Checkpoint};
use super::store::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use crate::core::StageResult;
use crate::errors::{ConfigurationError, StagerunError};
use crate::utils::validate_run_id;
use dashmap::DashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

type ClaimMap = Arc<DashMap<String, ()>>;

/// Loads, verifies and atomically saves run checkpoints.
///
/// Each run id has at most one writer at a time within a process; see
/// [`CheckpointManager::claim`]. File-backed managers over the same
/// directory share their claims. Managers built with [`new`](Self::new)
/// claim only among their own clones.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    active: ClaimMap,
}

impl CheckpointManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Creates a manager storing one file per run in `dir`.
    #[must_use]
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let active = claims_for_dir(&dir);
        Self {
            store: Arc::new(FileCheckpointStore::new(dir)),
            active,
        }
    }

    /// Creates a manager over a fresh in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCheckpointStore::new()))
    }

    /// Takes the single-writer claim for `run_id`.
    ///
    /// The claim is released when the returned guard is dropped.
    pub fn claim(&self, run_id: &str) -> Result<RunClaim, StagerunError> {
        check_run_id(run_id)?;
        match self.active.entry(run_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StagerunError::RunActive(run_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(RunClaim {
                    run_id: run_id.to_string(),
                    active: Arc::clone(&self.active),
                })
            }
        }
    }

    /// Loads the checkpoint for `run_id`, or `None` if the run is unknown.
    pub async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, StagerunError> {
        check_run_id(run_id)?;
        let Some(bytes) = self.store.load_raw(run_id).await? else {
            return Ok(None);
        };
        let checkpoint = decode(run_id, &self.store.location(run_id), &bytes)?;
        tracing::debug!(
            run_id,
            stages = checkpoint.stages.len(),
            status = %checkpoint.status,
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Serializes the full checkpoint and atomically replaces the stored record.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StagerunError> {
        check_run_id(&checkpoint.run_id)?;
        let bytes = encode(checkpoint)?;
        self.store.save_raw(&checkpoint.run_id, &bytes).await?;
        tracing::debug!(run_id = %checkpoint.run_id, status = %checkpoint.status, "Saved checkpoint");
        Ok(())
    }

    /// Marks `stage` as succeeded in the stored checkpoint (load, mutate, save).
    pub async fn mark_stage_complete(
        &self,
        run_id: &str,
        stage: &str,
        output_ref: Option<String>,
    ) -> Result<Checkpoint, StagerunError> {
        self.update(run_id, |cp| cp.mark_stage_complete(stage, output_ref))
            .await
    }

    /// Records a stage result in the stored checkpoint (load, mutate, save).
    ///
    /// A non-success result for a stage that already succeeded is ignored.
    pub async fn record_stage(
        &self,
        run_id: &str,
        result: StageResult,
    ) -> Result<Checkpoint, StagerunError> {
        self.update(run_id, |cp| {
            cp.record(result);
        })
        .await
    }

    /// Moves the stored record for `run_id` aside. Returns its new location.
    pub async fn quarantine(&self, run_id: &str) -> Result<Option<String>, StagerunError> {
        check_run_id(run_id)?;
        let moved = self.store.quarantine(run_id).await?;
        if let Some(ref location) = moved {
            tracing::warn!(run_id, location = %location, "Quarantined checkpoint");
        }
        Ok(moved)
    }

    /// Lists run ids with a stored checkpoint.
    pub async fn list_runs(&self) -> Result<Vec<String>, StagerunError> {
        Ok(self.store.list().await?)
    }

    /// Location of the record for `run_id`.
    #[must_use]
    pub fn location(&self, run_id: &str) -> String {
        self.store.location(run_id)
    }

    async fn update<F>(&self, run_id: &str, mutate: F) -> Result<Checkpoint, StagerunError>
    where
        F: FnOnce(&mut Checkpoint),
    {
        let _claim = self.claim(run_id)?;
        let mut checkpoint = self
            .load(run_id)
            .await?
            .ok_or_else(|| StagerunError::RunNotFound(run_id.to_string()))?;
        mutate(&mut checkpoint);
        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }
}

impl fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// Guard for the single-writer claim on a run.
#[derive(Debug)]
pub struct RunClaim {
    run_id: String,
    active: ClaimMap,
}

impl RunClaim {
    /// The claimed run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

/// Process-wide claim map for a checkpoint directory.
fn claims_for_dir(dir: &Path) -> ClaimMap {
    static BY_DIR: OnceLock<DashMap<PathBuf, ClaimMap>> = OnceLock::new();
    let key = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir().map_or_else(|_| dir.to_path_buf(), |cwd| cwd.join(dir))
    };
    BY_DIR
        .get_or_init(DashMap::new)
        .entry(key)
        .or_default()
        .value()
        .clone()
}

fn check_run_id(run_id: &str) -> Result<(), ConfigurationError> {
    validate_run_id(run_id).map_err(|e| ConfigurationError::new(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::store::MockCheckpointStore;
    use crate::core::StageStatus;
    use pretty_assertions::assert_eq;

    async fn seeded(manager: &CheckpointManager) -> Checkpoint {
        let mut cp = Checkpoint::new("run-1", "video");
        cp.ensure_stages(&["ingest", "transform"]);
        manager.save(&cp).await.unwrap();
        cp
    }

    #[tokio::test]
    async fn test_load_missing_run() {
        let manager = CheckpointManager::in_memory();
        assert!(manager.load("run-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_run_id_rejected() {
        let manager = CheckpointManager::in_memory();
        let err = manager.load("../escape").await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let manager = CheckpointManager::in_memory();
        let cp = seeded(&manager).await;
        assert_eq!(manager.load("run-1").await.unwrap().unwrap(), cp);
    }

    #[tokio::test]
    async fn test_mark_stage_complete() {
        let manager = CheckpointManager::in_memory();
        seeded(&manager).await;

        let cp = manager
            .mark_stage_complete("run-1", "ingest", Some("raw/1".into()))
            .await
            .unwrap();
        assert!(cp.is_stage_succeeded("ingest"));

        let reloaded = manager.load("run-1").await.unwrap().unwrap();
        let ingest = reloaded.stage("ingest").unwrap();
        assert_eq!(ingest.status, StageStatus::Succeeded);
        assert_eq!(ingest.output_ref.as_deref(), Some("raw/1"));
    }

    #[tokio::test]
    async fn test_mark_stage_complete_unknown_run() {
        let manager = CheckpointManager::in_memory();
        let err = manager.mark_stage_complete("run-9", "ingest", None).await.unwrap_err();
        assert!(matches!(err, StagerunError::RunNotFound(id) if id == "run-9"));
    }

    #[tokio::test]
    async fn test_record_stage_is_monotonic() {
        let manager = CheckpointManager::in_memory();
        seeded(&manager).await;
        manager.mark_stage_complete("run-1", "ingest", None).await.unwrap();

        let mut failed = StageResult::pending("ingest");
        failed.fail(2, "boom");
        let cp = manager.record_stage("run-1", failed).await.unwrap();
        assert!(cp.is_stage_succeeded("ingest"));
    }

    #[tokio::test]
    async fn test_single_writer_claim() {
        let manager = CheckpointManager::in_memory();
        seeded(&manager).await;

        let claim = manager.claim("run-1").unwrap();
        assert_eq!(claim.run_id(), "run-1");
        assert!(matches!(manager.claim("run-1"), Err(StagerunError::RunActive(_))));
        assert!(manager.mark_stage_complete("run-1", "ingest", None).await.is_err());

        drop(claim);
        assert!(manager.mark_stage_complete("run-1", "ingest", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_file_managers_share_claims_per_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let other = tempfile::TempDir::new().unwrap();
        let first = CheckpointManager::file(dir.path());
        let second = CheckpointManager::file(dir.path());
        let elsewhere = CheckpointManager::file(other.path());

        let claim = first.claim("run-1").unwrap();
        assert!(matches!(second.claim("run-1"), Err(StagerunError::RunActive(_))));
        assert!(elsewhere.claim("run-1").is_ok());

        drop(claim);
        assert!(second.claim("run-1").is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_record_and_quarantine() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        store.put_raw("run-1", "{ truncated");
        let manager = CheckpointManager::new(store.clone());

        let err = manager.load("run-1").await.unwrap_err();
        assert_eq!(err.exit_code(), 4);

        assert!(manager.quarantine("run-1").await.unwrap().is_some());
        assert!(manager.load("run-1").await.unwrap().is_none());
        assert_eq!(store.quarantined_count(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::file(dir.path());
        seeded(&manager).await;

        assert_eq!(manager.list_runs().await.unwrap(), vec!["run-1"]);
        assert!(manager.location("run-1").ends_with("run-1.json"));

        let other = CheckpointManager::file(dir.path());
        assert!(other.load("run-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_write_failure_propagates() {
        let mut store = MockCheckpointStore::new();
        store
            .expect_save_raw()
            .returning(|_, _| Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
        let manager = CheckpointManager::new(Arc::new(store));

        let err = manager.save(&Checkpoint::new("run-1", "video")).await.unwrap_err();
        assert!(matches!(err, StagerunError::Io(_)));
    }
}
