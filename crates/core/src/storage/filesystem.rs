use super::{sort_newest_first, StorageBackend};
use crate::types::{RunId, RunRecord};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One JSON document per run under a single directory
///
/// Layout: `<base>/<run_id>.json`. Writes go to a sibling temp file that is
/// synced and then renamed over the target; the directory is synced after the
/// rename on unix. A reader sees either the previous record or the new one.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    base_path: PathBuf,
}

impl FilesystemStorage {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create run storage directory")?;
        Ok(Self { base_path })
    }

    fn record_path(&self, id: &RunId) -> PathBuf {
        self.base_path.join(format!("{}.json", id))
    }

    fn temp_path(&self, id: &RunId) -> PathBuf {
        self.base_path.join(format!("{}.json.tmp", id))
    }

    async fn read_record(&self, path: &Path) -> Result<RunRecord> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read run record {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse run record {}", path.display()))
    }
}

#[async_trait::async_trait]
impl StorageBackend for FilesystemStorage {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record).context("Failed to serialize run record")?;
        let temp = self.temp_path(&record.id);

        let mut file = tokio::fs::File::create(&temp)
            .await
            .context("Failed to create run record file")?;
        file.write_all(&json)
            .await
            .context("Failed to write run record")?;
        file.sync_all().await.context("Failed to sync run record")?;
        drop(file);

        tokio::fs::rename(&temp, self.record_path(&record.id))
            .await
            .context("Failed to move run record into place")?;

        // Make the rename itself durable
        #[cfg(unix)]
        tokio::fs::File::open(&self.base_path)
            .await
            .context("Failed to open run storage directory")?
            .sync_all()
            .await
            .context("Failed to sync run storage directory")?;

        Ok(())
    }

    async fn load(&self, id: &RunId) -> Result<Option<RunRecord>> {
        let path = self.record_path(id);
        if !tokio::fs::try_exists(&path)
            .await
            .context("Failed to stat run record")?
        {
            return Ok(None);
        }

        self.read_record(&path).await.map(Some)
    }

    async fn list(&self) -> Result<Vec<RunRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path)
            .await
            .context("Failed to read run storage directory")?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to read directory entry")?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            records.push(self.read_record(&path).await?);
        }

        sort_newest_first(&mut records);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunStatus, StepFailure};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_filesystem_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path().join("runs")).unwrap();

        let mut record = RunRecord::new(RunId::new(), "wf", json!({"order": 7}));
        record.status = RunStatus::Failed;
        record.failure = Some(StepFailure {
            step: "charge".to_string(),
            error: "card declined".to_string(),
            attempts: 2,
        });
        storage.save(&record).await.unwrap();

        let loaded = storage.load(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(!storage.temp_path(&record.id).exists());
        assert!(storage.record_path(&record.id).is_file());

        // Overwrite in place
        record.status = RunStatus::Running;
        record.failure = None;
        storage.save(&record).await.unwrap();
        assert_eq!(storage.list().await.unwrap(), vec![record.clone()]);

        assert!(storage.load(&RunId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();

        let record = RunRecord::new(RunId::new(), "wf", json!(null));
        FilesystemStorage::new(path.clone())
            .unwrap()
            .save(&record)
            .await
            .unwrap();

        let reopened = FilesystemStorage::new(path).unwrap();
        let listed = reopened.list().await.unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[tokio::test]
    async fn test_list_skips_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path().to_path_buf()).unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "hello").unwrap();

        assert!(storage.list().await.unwrap().is_empty());
    }
}
