//! Durable, atomic persistence of run progress.
//!
//! A [`Checkpoint`] records the status of every stage of one run and is the
//! sole source of truth for whether a stage already produced valid output.
//! It is stored as a checksummed JSON envelope:
//!
//! ```json
//! {"format": "stagerun.checkpoint", "version": 1, "checksum": "<sha256>", "checkpoint": {...}}
//! ```

mod manager;
mod record;
mod store;

pub use manager::{CheckpointManager, RunClaim};
pub use record::{decode, encode, Checkpoint, CHECKPOINT_FORMAT, CHECKPOINT_VERSION};
pub use store::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};

#[cfg(test)]
pub(crate) use store::MockCheckpointStore;
