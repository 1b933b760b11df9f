//! Durable snapshots of a run for crash recovery and resume.
//!
//! - `store` - the key/blob contract plus file and memory implementations
//! - `codec` - checkpoint contents and the digest-prefixed encoding
//! - `manager` - save/load/list and the background writer

mod codec;
mod manager;
mod store;

pub use codec::{CHECKPOINT_VERSION, Checkpoint, CheckpointMeta, checkpoint_id, decode, encode};
pub use manager::{CheckpointManager, CheckpointWriter, LATEST};
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
