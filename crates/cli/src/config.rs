use anyhow::{Context, Result};
use flux_core::{FilesystemStorage, InMemoryStorage, RedbStorage, StorageBackend};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which storage backend keeps run records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Lost when the process exits
    Memory,
    Filesystem,
    #[default]
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,

    #[serde(default = "default_runs_dir")]
    pub runs_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_runs_dir() -> String {
    "runs".to_string()
}

fn default_index_file() -> String {
    "flux.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::default(),
            runs_dir: default_runs_dir(),
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    #[serde(default = "default_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "flux=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

impl FluxConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                logging: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Directory for the filesystem backend
    pub fn runs_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.runs_dir)
    }

    /// Database file for the redb backend
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    pub fn open_storage(&self) -> Result<Arc<dyn StorageBackend>> {
        let storage: Arc<dyn StorageBackend> = match self.storage.backend {
            StorageKind::Memory => Arc::new(InMemoryStorage::new()),
            StorageKind::Filesystem => Arc::new(
                FilesystemStorage::new(self.runs_path())
                    .context("Failed to create filesystem storage")?,
            ),
            StorageKind::Redb => Arc::new(
                RedbStorage::new(self.index_path()).context("Failed to create redb storage")?,
            ),
        };
        Ok(storage)
    }
}
