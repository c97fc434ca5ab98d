use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::error::{RecastError, Result};
use crate::domain::ingestion::Ingestion;
use crate::domain::journal::{DecisionEntry, Stage};
use crate::domain::mapping::MappingTemplate;
use crate::domain::schema::CanonicalSchema;
use crate::storage::traits::{BlobStore, JobQueue, RecordStore, StageJob};

/// Blob store backed by a map, with a temp-dir spill so `local_path` works.
/// Test and single-process backend.
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    spill_dir: PathBuf,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        let spill_dir = std::env::temp_dir().join(format!("recast-blobs-{}", Uuid::new_v4()));
        Self {
            blobs: RwLock::new(HashMap::new()),
            spill_dir,
        }
    }

    fn spill_path(&self, key: &str) -> PathBuf {
        self.spill_dir.join(key.replace('/', "__"))
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .expect("blob lock poisoned")
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .expect("blob lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| RecastError::BlobNotFound(key.to_string()))
    }

    async fn local_path(&self, key: &str) -> Result<PathBuf> {
        let bytes = self.load(key).await?;
        std::fs::create_dir_all(&self.spill_dir)?;
        let path = self.spill_path(key);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs
            .write()
            .expect("blob lock poisoned")
            .remove(key);
        let _ = std::fs::remove_file(self.spill_path(key));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .blobs
            .read()
            .expect("blob lock poisoned")
            .contains_key(key))
    }
}

/// Record store backed by maps. Test and single-process backend.
#[derive(Default)]
pub struct MemoryRecordStore {
    ingestions: RwLock<HashMap<Uuid, Ingestion>>,
    schemas: RwLock<HashMap<Uuid, CanonicalSchema>>,
    decisions: RwLock<Vec<DecisionEntry>>,
    templates: RwLock<HashMap<(Uuid, String), MappingTemplate>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_ingestion(&self, ingestion: &Ingestion) -> Result<()> {
        self.ingestions
            .write()
            .expect("record lock poisoned")
            .insert(ingestion.id, ingestion.clone());
        Ok(())
    }

    async fn update_ingestion(&self, ingestion: &Ingestion) -> Result<()> {
        let mut guard = self.ingestions.write().expect("record lock poisoned");
        if !guard.contains_key(&ingestion.id) {
            return Err(RecastError::IngestionNotFound(ingestion.id));
        }
        guard.insert(ingestion.id, ingestion.clone());
        Ok(())
    }

    async fn get_ingestion(&self, id: Uuid) -> Result<Option<Ingestion>> {
        Ok(self
            .ingestions
            .read()
            .expect("record lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn delete_ingestion(&self, id: Uuid) -> Result<()> {
        self.ingestions
            .write()
            .expect("record lock poisoned")
            .remove(&id);
        self.decisions
            .write()
            .expect("journal lock poisoned")
            .retain(|e| e.ingestion_id != id);
        Ok(())
    }

    async fn put_schema(&self, schema: &CanonicalSchema) -> Result<()> {
        self.schemas
            .write()
            .expect("record lock poisoned")
            .insert(schema.id, schema.clone());
        Ok(())
    }

    async fn get_schema(&self, id: Uuid) -> Result<Option<CanonicalSchema>> {
        Ok(self
            .schemas
            .read()
            .expect("record lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn list_schemas(&self) -> Result<Vec<CanonicalSchema>> {
        let mut schemas: Vec<_> = self
            .schemas
            .read()
            .expect("record lock poisoned")
            .values()
            .cloned()
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schemas)
    }

    async fn append_decision(&self, entry: &DecisionEntry) -> Result<()> {
        self.decisions
            .write()
            .expect("journal lock poisoned")
            .push(entry.clone());
        Ok(())
    }

    async fn list_decisions(
        &self,
        ingestion_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<DecisionEntry>> {
        let guard = self.decisions.read().expect("journal lock poisoned");
        Ok(guard
            .iter()
            .filter(|e| e.ingestion_id == ingestion_id)
            .filter(|e| stage.map_or(true, |s| e.stage == s))
            .cloned()
            .collect())
    }

    async fn purge_decisions(&self, ingestion_id: Uuid, stage: Stage) -> Result<()> {
        self.decisions
            .write()
            .expect("journal lock poisoned")
            .retain(|e| !(e.ingestion_id == ingestion_id && e.stage == stage));
        Ok(())
    }

    async fn get_template(
        &self,
        schema_id: Uuid,
        source_fingerprint: &str,
    ) -> Result<Option<MappingTemplate>> {
        Ok(self
            .templates
            .read()
            .expect("record lock poisoned")
            .get(&(schema_id, source_fingerprint.to_string()))
            .cloned())
    }

    async fn put_template(&self, template: &MappingTemplate) -> Result<()> {
        self.templates.write().expect("record lock poisoned").insert(
            (template.schema_id, template.source_fingerprint.clone()),
            template.clone(),
        );
        Ok(())
    }
}

/// Per-stage FIFO queues with pending-job dedupe by job id.
#[derive(Default)]
pub struct MemoryJobQueue {
    queues: RwLock<HashMap<Stage, VecDeque<StageJob>>>,
    pending_ids: RwLock<HashSet<String>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: StageJob) -> Result<()> {
        let mut ids = self.pending_ids.write().expect("queue lock poisoned");
        if !ids.insert(job.job_id.clone()) {
            return Ok(());
        }
        self.queues
            .write()
            .expect("queue lock poisoned")
            .entry(job.stage)
            .or_default()
            .push_back(job);
        Ok(())
    }

    async fn dequeue(&self, stage: Stage) -> Result<Option<StageJob>> {
        let job = self
            .queues
            .write()
            .expect("queue lock poisoned")
            .get_mut(&stage)
            .and_then(|q| q.pop_front());
        if let Some(job) = &job {
            self.pending_ids
                .write()
                .expect("queue lock poisoned")
                .remove(&job.job_id);
        }
        Ok(job)
    }

    async fn pending(&self, stage: Stage) -> Result<usize> {
        Ok(self
            .queues
            .read()
            .expect("queue lock poisoned")
            .get(&stage)
            .map_or(0, |q| q.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blob_round_trip_and_spill() {
        let store = MemoryBlobStore::new();
        store.save("raw/a.csv", b"x,y\n1,2\n").await.unwrap();
        assert!(store.exists("raw/a.csv").await.unwrap());
        assert_eq!(store.load("raw/a.csv").await.unwrap(), b"x,y\n1,2\n");

        let path = store.local_path("raw/a.csv").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"x,y\n1,2\n");

        store.delete("raw/a.csv").await.unwrap();
        assert!(!store.exists("raw/a.csv").await.unwrap());
        assert!(store.load("raw/a.csv").await.is_err());
    }

    #[tokio::test]
    async fn journal_is_append_only_and_purgeable_per_stage() {
        let store = MemoryRecordStore::new();
        let id = Uuid::new_v4();
        for (stage, kind) in [(Stage::Parse, "parse_complete"), (Stage::Map, "column_mapped")] {
            store
                .append_decision(&DecisionEntry::new(id, stage, kind, serde_json::json!({})))
                .await
                .unwrap();
        }
        assert_eq!(store.list_decisions(id, None).await.unwrap().len(), 2);
        assert_eq!(
            store
                .list_decisions(id, Some(Stage::Map))
                .await
                .unwrap()
                .len(),
            1
        );

        store.purge_decisions(id, Stage::Map).await.unwrap();
        let remaining = store.list_decisions(id, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stage, Stage::Parse);
    }

    #[tokio::test]
    async fn queue_dedupes_pending_job_ids() {
        let queue = MemoryJobQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(StageJob::new(Stage::Parse, id)).await.unwrap();
        queue.enqueue(StageJob::new(Stage::Parse, id)).await.unwrap();
        assert_eq!(queue.pending(Stage::Parse).await.unwrap(), 1);

        let job = queue.dequeue(Stage::Parse).await.unwrap().unwrap();
        assert_eq!(job.ingestion_id, id);
        assert!(queue.dequeue(Stage::Parse).await.unwrap().is_none());

        // Once consumed, the same id may be enqueued again.
        queue.enqueue(StageJob::new(Stage::Parse, id)).await.unwrap();
        assert_eq!(queue.pending(Stage::Parse).await.unwrap(), 1);
    }
}
