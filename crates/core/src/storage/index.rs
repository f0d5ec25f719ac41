use super::{sort_newest_first, StorageBackend};
use crate::types::{RunId, RunRecord};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Run storage backed by an embedded redb database
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put_run(db: &Database, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_vec(record).context("Failed to serialize run")?;
        let write_txn = db.begin_write().context("Failed to begin write")?;
        {
            let mut runs = write_txn.open_table(RUNS_TABLE).context("Failed to open table")?;
            runs.insert(record.id.to_string().as_str(), json.as_slice())
                .context("Failed to store run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_run(db: &Database, id: &RunId) -> Result<Option<RunRecord>> {
        let read_txn = db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let run = table
            .get(id.to_string().as_str())
            .context("Failed to get run")?
            .map(|stored| serde_json::from_slice(stored.value()))
            .transpose()
            .context("Failed to deserialize run")?;
        Ok(run)
    }

    fn all_runs(db: &Database) -> Result<Vec<RunRecord>> {
        let read_txn = db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: RunRecord =
                serde_json::from_slice(value.value()).context("Failed to deserialize run")?;
            runs.push(run);
        }

        sort_newest_first(&mut runs);
        Ok(runs)
    }
}

// redb transactions block, so they run off the async worker threads.
#[async_trait::async_trait]
impl StorageBackend for RedbStorage {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        let db = self.db.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || Self::put_run(&db, &record))
            .await
            .context("Storage task panicked")?
    }

    async fn load(&self, id: &RunId) -> Result<Option<RunRecord>> {
        let db = self.db.clone();
        let id = *id;
        tokio::task::spawn_blocking(move || Self::get_run(&db, &id))
            .await
            .context("Storage task panicked")?
    }

    async fn list(&self) -> Result<Vec<RunRecord>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || Self::all_runs(&db))
            .await
            .context("Storage task panicked")?
    }
}
