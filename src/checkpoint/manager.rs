//! Save, load and list checkpoints over a [`CheckpointStore`].

use crate::checkpoint::codec::{Checkpoint, CheckpointMeta, decode, encode};
use crate::checkpoint::store::CheckpointStore;
use crate::errors::CheckpointError;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Selector accepted by [`CheckpointManager::load`] for the newest valid
/// checkpoint.
pub const LATEST: &str = "latest";

/// Entry point for checkpoint persistence.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Persist a checkpoint; returns its id.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<String, CheckpointError> {
        let blob = encode(checkpoint)?;
        self.store.put(&checkpoint.id, blob).await?;
        tracing::debug!(
            checkpoint = %checkpoint.id,
            sequence = checkpoint.sequence,
            "Checkpoint saved"
        );
        Ok(checkpoint.id.clone())
    }

    /// Load by id, or the newest valid checkpoint for `"latest"`.
    pub async fn load(&self, selector: &str) -> Result<Checkpoint, CheckpointError> {
        if selector == LATEST {
            return self.latest().await;
        }
        let blob = self.store.get(selector).await?;
        decode(selector, &blob)
    }

    /// Newest checkpoint that passes validation. Invalid blobs are skipped.
    pub async fn latest(&self) -> Result<Checkpoint, CheckpointError> {
        let keys = self.store.list_keys().await?;
        for key in keys.iter().rev() {
            match self.load_valid(key).await {
                Ok(checkpoint) => return Ok(checkpoint),
                Err(e) => {
                    tracing::warn!(checkpoint = %key, error = %e, "Skipping invalid checkpoint");
                }
            }
        }
        Err(CheckpointError::NoneAvailable)
    }

    /// Metadata of every valid checkpoint, oldest first.
    pub async fn list(&self) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let keys = self.store.list_keys().await?;
        let mut metas = Vec::with_capacity(keys.len());
        for key in &keys {
            match self.load_valid(key).await {
                Ok(checkpoint) => metas.push(checkpoint.metadata()),
                Err(e) => {
                    tracing::warn!(checkpoint = %key, error = %e, "Skipping invalid checkpoint");
                }
            }
        }
        Ok(metas)
    }

    async fn load_valid(&self, key: &str) -> Result<Checkpoint, CheckpointError> {
        let blob = self.store.get(key).await?;
        let checkpoint = decode(key, &blob)?;
        checkpoint.resolve()?;
        Ok(checkpoint)
    }

    /// Start a background writer that persists submitted snapshots.
    pub fn spawn_writer(&self) -> CheckpointWriter {
        CheckpointWriter::spawn(self.clone())
    }
}

/// Persists snapshots off the scheduling path. Only the newest submitted
/// snapshot is written; older pending ones are superseded.
pub struct CheckpointWriter {
    tx: watch::Sender<Option<Arc<Checkpoint>>>,
    handle: JoinHandle<()>,
    manager: CheckpointManager,
}

impl CheckpointWriter {
    fn spawn(manager: CheckpointManager) -> Self {
        let (tx, mut rx) = watch::channel::<Option<Arc<Checkpoint>>>(None);
        let writer_manager = manager.clone();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let pending = rx.borrow_and_update().clone();
                let Some(checkpoint) = pending else { continue };
                if let Err(e) = writer_manager.save(&checkpoint).await {
                    // Retried with the next snapshot
                    tracing::warn!(
                        checkpoint = %checkpoint.id,
                        error = %e,
                        "Background checkpoint save failed"
                    );
                }
            }
        });

        Self { tx, handle, manager }
    }

    /// Queue a snapshot for writing without waiting.
    pub fn submit(&self, checkpoint: Checkpoint) {
        self.tx.send_replace(Some(Arc::new(checkpoint)));
    }

    /// Drain the writer, then save `last` and wait for it to be durable.
    pub async fn finish(self, last: Checkpoint) -> Result<String, CheckpointError> {
        let Self {
            tx,
            handle,
            manager,
        } = self;
        drop(tx);
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Checkpoint writer task failed");
        }
        manager.save(&last).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::store::MemoryCheckpointStore;
    use crate::config::RunConfig;
    use crate::dag::Resolver;
    use crate::plan::{PhaseSpec, Plan};
    use crate::recovery::RecoveryCounters;
    use crate::state::ExecutionState;
    use uuid::Uuid;

    fn checkpoint(run_id: Uuid, sequence: u64) -> Checkpoint {
        let plan = Plan::new(vec![PhaseSpec::new("01", vec![])]);
        let graph = Resolver::resolve(&plan).unwrap();
        Checkpoint::new(
            run_id,
            sequence,
            plan,
            ExecutionState::new(&graph),
            RecoveryCounters::default(),
            RunConfig::default(),
        )
    }

    fn manager() -> (Arc<MemoryCheckpointStore>, CheckpointManager) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let manager = CheckpointManager::new(store.clone());
        (store, manager)
    }

    #[tokio::test]
    async fn test_save_and_load_by_id() {
        let (_, manager) = manager();
        let cp = checkpoint(Uuid::new_v4(), 1);

        let id = manager.save(&cp).await.unwrap();
        assert_eq!(manager.load(&id).await.unwrap(), cp);
    }

    #[tokio::test]
    async fn test_latest_skips_corrupt_blobs() {
        let (store, manager) = manager();
        let run = Uuid::new_v4();
        let good = checkpoint(run, 1);
        manager.save(&good).await.unwrap();

        // Sorts after the good one
        store
            .put("9999999999999-ffffffff-000002", b"deadbeef\n{}".to_vec())
            .await
            .unwrap();

        let latest = manager.load(LATEST).await.unwrap();
        assert_eq!(latest.id, good.id);
        assert_eq!(manager.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_on_empty_store() {
        let (_, manager) = manager();
        let err = manager.latest().await.unwrap_err();
        assert!(matches!(err, CheckpointError::NoneAvailable));
    }

    #[tokio::test]
    async fn test_load_unknown_id() {
        let (_, manager) = manager();
        let err = manager.load("nope").await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_writer_finish_persists_last_snapshot() {
        let (store, manager) = manager();
        let run = Uuid::new_v4();

        let writer = manager.spawn_writer();
        writer.submit(checkpoint(run, 1));
        writer.submit(checkpoint(run, 2));
        let last = checkpoint(run, 3);
        let id = writer.finish(last.clone()).await.unwrap();

        assert_eq!(id, last.id);
        assert!(!store.is_empty());
        assert_eq!(manager.latest().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_list_is_chronological() {
        let (_, manager) = manager();
        let run = Uuid::new_v4();
        for seq in 1..=3 {
            manager.save(&checkpoint(run, seq)).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let seqs: Vec<u64> = manager
            .list()
            .await
            .unwrap()
            .iter()
            .map(|m| m.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
