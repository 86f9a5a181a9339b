//! Storage implementations.

use std::sync::Arc;

use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::interfaces::event_store::{EventStore, StorageError};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryEventStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventStore;

/// Initialize the event store selected by configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn EventStore>, StorageError> {
    info!(
        storage_type = config.storage_type.as_str(),
        path = %config.path,
        "Initializing storage"
    );

    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(MemoryEventStore::new())),
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::UnknownBackend(format!(
                            "cannot create {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
            }

            let options = SqliteConnectOptions::new()
                .filename(&config.path)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .connect_with(options)
                .await?;

            let store = SqliteEventStore::new(pool);
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => Err(StorageError::UnknownBackend(
            "sqlite requested but the 'sqlite' feature is not enabled".to_string(),
        )),
    }
}
