pub mod filesystem;
pub mod index;
pub mod memory;

pub use filesystem::FilesystemStorage;
pub use index::RedbStorage;
pub use memory::InMemoryStorage;

use crate::types::{RunId, RunRecord};
use anyhow::Result;

/// Persistence for run records
///
/// Implementations must return exactly what was saved and tolerate concurrent
/// calls for distinct ids. The engine never issues overlapping saves for the
/// same id.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist the full record, replacing any previous version for its id
    async fn save(&self, record: &RunRecord) -> Result<()>;

    /// Load a record by id
    async fn load(&self, id: &RunId) -> Result<Option<RunRecord>>;

    /// All stored records, most recently created first
    async fn list(&self) -> Result<Vec<RunRecord>>;
}

pub(crate) fn sort_newest_first(records: &mut [RunRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
