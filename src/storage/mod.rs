pub mod models;
pub mod sqlite_manager;

use async_trait::async_trait;

use crate::config::settings::SqliteConfig;
use crate::utils::error::TelemetryError;

pub use models::{MappingRow, Reading, ReadingBatch};
pub use sqlite_manager::{ProvisionSummary, SqliteManager};

#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn load_active_mappings(&self) -> Result<Vec<MappingRow>, TelemetryError>;

    /// Persists the whole batch atomically and returns the number of rows.
    async fn commit_batch(&self, batch: &ReadingBatch) -> Result<usize, TelemetryError>;

    async fn close(&self) {}
}

#[async_trait]
pub trait StorageConnector: Send + Sync {
    type Store: ReadingStore;

    async fn connect(&self) -> Result<Self::Store, TelemetryError>;
}

#[async_trait]
impl ReadingStore for SqliteManager {
    async fn load_active_mappings(&self) -> Result<Vec<MappingRow>, TelemetryError> {
        SqliteManager::load_active_mappings(self).await
    }

    async fn commit_batch(&self, batch: &ReadingBatch) -> Result<usize, TelemetryError> {
        self.insert_batch(batch).await
    }

    async fn close(&self) {
        SqliteManager::close(self).await
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConnector {
    config: SqliteConfig,
}

impl SqliteConnector {
    pub fn new(config: SqliteConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StorageConnector for SqliteConnector {
    type Store = SqliteManager;

    async fn connect(&self) -> Result<SqliteManager, TelemetryError> {
        SqliteManager::new(&self.config).await
    }
}
