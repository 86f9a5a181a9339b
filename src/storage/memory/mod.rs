//! In-memory event store.
//!
//! Every check and append for a call happens under one write guard, so the
//! sequence check and the idempotency-key check are atomic with the insert.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::interfaces::event_store::{
    EventPage, EventStore, KeyedEvent, NewEvent, Result, StorageError,
};

/// Key type for streams: (domain, root).
type StreamKey = (String, Uuid);

#[derive(Default)]
struct Inner {
    streams: HashMap<StreamKey, Vec<EventPage>>,
    /// Idempotency key -> (stream, index into the stream).
    keys: HashMap<String, (StreamKey, usize)>,
}

/// Event store that keeps every stream in memory.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
    fail_on_add: RwLock<bool>,
    fail_on_read: RwLock<bool>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `add` fail with a sequence conflict.
    pub async fn set_fail_on_add(&self, fail: bool) {
        *self.fail_on_add.write().await = fail;
    }

    /// Make every subsequent stream read fail.
    pub async fn set_fail_on_read(&self, fail: bool) {
        *self.fail_on_read.write().await = fail;
    }

    async fn check_read(&self) -> Result<()> {
        if *self.fail_on_read.read().await {
            return Err(StorageError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }

    /// Total number of stored events across all streams.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.streams.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn add(
        &self,
        domain: &str,
        root: Uuid,
        expected_sequence: u32,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventPage>> {
        if *self.fail_on_add.read().await {
            return Err(StorageError::SequenceConflict {
                expected: expected_sequence,
                actual: u32::MAX,
            });
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.write().await;

        let mut batch_keys: Vec<&str> = Vec::new();
        for key in events.iter().filter_map(|e| e.idempotency_key.as_deref()) {
            if inner.keys.contains_key(key) || batch_keys.contains(&key) {
                return Err(StorageError::DuplicateKey {
                    key: key.to_string(),
                });
            }
            batch_keys.push(key);
        }

        let stream_key = (domain.to_string(), root);
        let next = inner
            .streams
            .get(&stream_key)
            .map(|s| s.len() as u32)
            .unwrap_or(0);
        if next != expected_sequence {
            return Err(StorageError::SequenceConflict {
                expected: next,
                actual: expected_sequence,
            });
        }

        let recorded_at = Utc::now();
        let pages: Vec<EventPage> = events
            .into_iter()
            .enumerate()
            .map(|(offset, e)| EventPage {
                sequence: next + offset as u32,
                recorded_at,
                idempotency_key: e.idempotency_key,
                event: e.event,
            })
            .collect();

        for page in &pages {
            if let Some(key) = &page.idempotency_key {
                inner
                    .keys
                    .insert(key.clone(), (stream_key.clone(), page.sequence as usize));
            }
        }
        inner
            .streams
            .entry(stream_key)
            .or_default()
            .extend(pages.iter().cloned());

        Ok(pages)
    }

    async fn get(&self, domain: &str, root: Uuid) -> Result<Vec<EventPage>> {
        self.get_from(domain, root, 0).await
    }

    async fn get_from(&self, domain: &str, root: Uuid, from: u32) -> Result<Vec<EventPage>> {
        self.check_read().await?;
        let inner = self.inner.read().await;
        Ok(inner
            .streams
            .get(&(domain.to_string(), root))
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_roots(&self, domain: &str) -> Result<Vec<Uuid>> {
        let inner = self.inner.read().await;
        let mut roots: Vec<Uuid> = inner
            .streams
            .keys()
            .filter(|(d, _)| d == domain)
            .map(|(_, r)| *r)
            .collect();
        roots.sort();
        Ok(roots)
    }

    async fn get_next_sequence(&self, domain: &str, root: Uuid) -> Result<u32> {
        let inner = self.inner.read().await;
        Ok(inner
            .streams
            .get(&(domain.to_string(), root))
            .map(|s| s.len() as u32)
            .unwrap_or(0))
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<KeyedEvent>> {
        let inner = self.inner.read().await;
        let Some(((domain, root), index)) = inner.keys.get(key) else {
            return Ok(None);
        };
        Ok(inner
            .streams
            .get(&(domain.clone(), *root))
            .and_then(|s| s.get(*index))
            .map(|page| KeyedEvent {
                domain: domain.clone(),
                root: *root,
                page: page.clone(),
            }))
    }
}
