//! Ingest Run Store: persists the audit record for each Scanner
//! execution — one row inserted with status `running` when a scan
//! starts, updated in place to its final status/counters/checkpoint
//! snapshot once the worker has committed the buffered items
//! (spec.md §4.7, §6). Trait/impl split matches `checkpoint_store`.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::IngestRun;

#[async_trait]
pub trait IngestRunStore: Send + Sync {
    /// Inserts `run` with its initial `running` status (scanner step 1).
    async fn start(&self, run: &IngestRun) -> anyhow::Result<()>;

    /// Overwrites the row identified by `run.id` with `run`'s final
    /// status, counters, and checkpoint snapshots.
    async fn finish(&self, run: &IngestRun) -> anyhow::Result<()>;
}

/// In-memory implementation used by tests — production wiring uses
/// [`crate::persistence::postgres::PostgresIngestRunStore`].
#[derive(Default)]
pub struct InMemoryIngestRunStore {
    runs: DashMap<Uuid, IngestRun>,
}

impl InMemoryIngestRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<IngestRun> {
        self.runs.get(&id).map(|r| r.clone())
    }
}

#[async_trait]
impl IngestRunStore for InMemoryIngestRunStore {
    async fn start(&self, run: &IngestRun) -> anyhow::Result<()> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finish(&self, run: &IngestRun) -> anyhow::Result<()> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Checkpoint, RunStatus};

    #[tokio::test]
    async fn start_then_finish_overwrites_the_same_row() {
        let store = InMemoryIngestRunStore::new();
        let thread_id = Uuid::new_v4();
        let mut run = IngestRun::start(thread_id, Checkpoint::fresh(thread_id));
        store.start(&run).await.unwrap();
        assert_eq!(store.get(run.id).unwrap().status, RunStatus::Running);

        run.status = RunStatus::Complete;
        run.items_new = 3;
        run.items_duplicate = 1;
        store.finish(&run).await.unwrap();

        let persisted = store.get(run.id).unwrap();
        assert_eq!(persisted.status, RunStatus::Complete);
        assert_eq!(persisted.items_new, 3);
        assert_eq!(persisted.items_duplicate, 1);
    }
}
