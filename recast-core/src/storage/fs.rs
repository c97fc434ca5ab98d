use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::common::error::{RecastError, Result};
use crate::domain::ingestion::Ingestion;
use crate::domain::journal::{DecisionEntry, Stage};
use crate::domain::mapping::MappingTemplate;
use crate::domain::schema::CanonicalSchema;
use crate::storage::traits::{BlobStore, RecordStore};

/// Blob store rooted at a local data directory. Keys map to paths under
/// `<root>/blobs/`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join("blobs").join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        debug!(key, bytes = bytes.len(), "blob written");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(key);
        if !path.exists() {
            return Err(RecastError::BlobNotFound(key.to_string()));
        }
        Ok(fs::read(path)?)
    }

    async fn local_path(&self, key: &str) -> Result<PathBuf> {
        let path = self.blob_path(key);
        if !path.exists() {
            return Err(RecastError::BlobNotFound(key.to_string()));
        }
        Ok(path)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blob_path(key).exists())
    }
}

/// Record store persisting JSON documents under a local data directory.
///
/// Journal entries live in one append-only NDJSON file per ingestion;
/// ingestions, schemas and templates are single JSON documents.
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        for dir in ["ingestions", "schemas", "templates", "journal"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root })
    }

    fn ingestion_path(&self, id: Uuid) -> PathBuf {
        self.root.join("ingestions").join(format!("{id}.json"))
    }

    fn schema_path(&self, id: Uuid) -> PathBuf {
        self.root.join("schemas").join(format!("{id}.json"))
    }

    fn template_path(&self, schema_id: Uuid, fingerprint: &str) -> PathBuf {
        let prefix: String = fingerprint.chars().take(16).collect();
        self.root
            .join("templates")
            .join(format!("{schema_id}-{prefix}.json"))
    }

    fn journal_path(&self, ingestion_id: Uuid) -> PathBuf {
        self.root.join("journal").join(format!("{ingestion_id}.ndjson"))
    }

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn read_journal(&self, ingestion_id: Uuid) -> Result<Vec<DecisionEntry>> {
        let path = self.journal_path(ingestion_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn create_ingestion(&self, ingestion: &Ingestion) -> Result<()> {
        Self::write_json(&self.ingestion_path(ingestion.id), ingestion)
    }

    async fn update_ingestion(&self, ingestion: &Ingestion) -> Result<()> {
        let path = self.ingestion_path(ingestion.id);
        if !path.exists() {
            return Err(RecastError::IngestionNotFound(ingestion.id));
        }
        Self::write_json(&path, ingestion)
    }

    async fn get_ingestion(&self, id: Uuid) -> Result<Option<Ingestion>> {
        Self::read_json(&self.ingestion_path(id))
    }

    async fn delete_ingestion(&self, id: Uuid) -> Result<()> {
        for path in [self.ingestion_path(id), self.journal_path(id)] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    async fn put_schema(&self, schema: &CanonicalSchema) -> Result<()> {
        Self::write_json(&self.schema_path(schema.id), schema)
    }

    async fn get_schema(&self, id: Uuid) -> Result<Option<CanonicalSchema>> {
        Self::read_json(&self.schema_path(id))
    }

    async fn list_schemas(&self) -> Result<Vec<CanonicalSchema>> {
        let mut schemas = Vec::new();
        for entry in fs::read_dir(self.root.join("schemas"))? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(schema) = Self::read_json::<CanonicalSchema>(&path)? {
                    schemas.push(schema);
                }
            }
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schemas)
    }

    async fn append_decision(&self, entry: &DecisionEntry) -> Result<()> {
        let path = self.journal_path(entry.ingestion_id);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    async fn list_decisions(
        &self,
        ingestion_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<DecisionEntry>> {
        Ok(self
            .read_journal(ingestion_id)?
            .into_iter()
            .filter(|e| stage.map_or(true, |s| e.stage == s))
            .collect())
    }

    async fn purge_decisions(&self, ingestion_id: Uuid, stage: Stage) -> Result<()> {
        let entries = self.read_journal(ingestion_id)?;
        let kept: Vec<_> = entries.into_iter().filter(|e| e.stage != stage).collect();
        let path = self.journal_path(ingestion_id);
        let mut buffer = String::new();
        for entry in &kept {
            buffer.push_str(&serde_json::to_string(entry)?);
            buffer.push('\n');
        }
        fs::write(path, buffer)?;
        Ok(())
    }

    async fn get_template(
        &self,
        schema_id: Uuid,
        source_fingerprint: &str,
    ) -> Result<Option<MappingTemplate>> {
        Self::read_json(&self.template_path(schema_id, source_fingerprint))
    }

    async fn put_template(&self, template: &MappingTemplate) -> Result<()> {
        Self::write_json(
            &self.template_path(template.schema_id, &template.source_fingerprint),
            template,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn blobs_round_trip_on_disk() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        store.save("raw/a.csv", b"h\n1\n").await.unwrap();
        assert!(store.exists("raw/a.csv").await.unwrap());
        assert_eq!(store.load("raw/a.csv").await.unwrap(), b"h\n1\n");
        let path = store.local_path("raw/a.csv").await.unwrap();
        assert!(path.ends_with("blobs/raw/a.csv"));
        store.delete("raw/a.csv").await.unwrap();
        assert!(!store.exists("raw/a.csv").await.unwrap());
    }

    #[tokio::test]
    async fn ingestions_and_journal_survive_reopen() {
        let dir = tempdir().unwrap();
        let ingestion = Ingestion::new("raw/a.csv", None, None);
        let id = ingestion.id;
        {
            let store = FsRecordStore::new(dir.path()).unwrap();
            store.create_ingestion(&ingestion).await.unwrap();
            store
                .append_decision(&DecisionEntry::new(
                    id,
                    Stage::Parse,
                    "parse_complete",
                    serde_json::json!({"row_count": 2}),
                ))
                .await
                .unwrap();
        }
        let reopened = FsRecordStore::new(dir.path()).unwrap();
        assert!(reopened.get_ingestion(id).await.unwrap().is_some());
        let decisions = reopened.list_decisions(id, None).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision_type, "parse_complete");
    }

    #[tokio::test]
    async fn purge_rewrites_only_the_named_stage() {
        let dir = tempdir().unwrap();
        let store = FsRecordStore::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        for stage in [Stage::Parse, Stage::Infer] {
            store
                .append_decision(&DecisionEntry::new(id, stage, "x", serde_json::json!({})))
                .await
                .unwrap();
        }
        store.purge_decisions(id, Stage::Infer).await.unwrap();
        let left = store.list_decisions(id, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].stage, Stage::Parse);
    }
}
