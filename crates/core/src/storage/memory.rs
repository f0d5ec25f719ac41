use super::{sort_newest_first, StorageBackend};
use crate::types::{RunId, RunRecord};
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-lifetime run storage
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    runs: RwLock<HashMap<RunId, RunRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl StorageBackend for InMemoryStorage {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        self.runs.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn load(&self, id: &RunId) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<RunRecord>> {
        let mut records: Vec<RunRecord> = self.runs.read().await.values().cloned().collect();
        sort_newest_first(&mut records);
        Ok(records)
    }
}
