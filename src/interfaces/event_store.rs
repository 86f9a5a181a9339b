//! Event storage interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::LedgerEvent;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict { expected: u32, actual: u32 },

    #[error("Idempotency key already recorded: {key}")]
    DuplicateKey { key: String },

    #[error("Event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown storage backend: {0}")]
    UnknownBackend(String),
}

impl StorageError {
    /// Whether reloading and re-deciding can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::SequenceConflict { .. })
    }
}

/// Event to append. The idempotency key, when present, must be globally unique.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event: LedgerEvent,
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    pub fn new(event: LedgerEvent) -> Self {
        Self {
            event,
            idempotency_key: None,
        }
    }

    pub fn keyed(event: LedgerEvent, key: impl Into<String>) -> Self {
        Self {
            event,
            idempotency_key: Some(key.into()),
        }
    }
}

/// Stored event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    pub sequence: u32,
    pub recorded_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub event: LedgerEvent,
}

/// Stored event located by its idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedEvent {
    pub domain: String,
    pub root: Uuid,
    pub page: EventPage,
}

/// Interface for event persistence.
///
/// The `(domain, root, sequence)` tuple forms the unique key for stored events.
/// `add` is atomic: either every event is appended or none is.
///
/// Implementations:
/// - `MemoryEventStore`: in-process storage (tests, standalone runs)
/// - `SqliteEventStore`: SQLite storage
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to a stream.
    ///
    /// Fails with `SequenceConflict` when `expected_sequence` is not the stream's
    /// next sequence, and with `DuplicateKey` when any idempotency key is already
    /// recorded anywhere in the store. Key checks run first.
    async fn add(
        &self,
        domain: &str,
        root: Uuid,
        expected_sequence: u32,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventPage>>;

    /// Retrieve all events for a stream.
    async fn get(&self, domain: &str, root: Uuid) -> Result<Vec<EventPage>>;

    /// Retrieve events from sequence N onwards.
    async fn get_from(&self, domain: &str, root: Uuid, from: u32) -> Result<Vec<EventPage>>;

    /// List all stream roots in a domain.
    async fn list_roots(&self, domain: &str) -> Result<Vec<Uuid>>;

    /// Get the next sequence number for a stream.
    async fn get_next_sequence(&self, domain: &str, root: Uuid) -> Result<u32>;

    /// Locate the event recorded under an idempotency key.
    async fn find_by_key(&self, key: &str) -> Result<Option<KeyedEvent>>;
}
