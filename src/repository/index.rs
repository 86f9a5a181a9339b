//! Lookup indexes stored as tiny event streams.
//!
//! Each index entry is a stream in domain `index.{kind}` whose root derives
//! from the key. A unique index allows one value per key; a multi-valued index
//! accumulates values, each appended at most once.

use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBuilder};
use uuid::Uuid;

use crate::events::LedgerEvent;
use crate::interfaces::event_store::{EventStore, NewEvent, Result, StorageError};
use crate::model::stream_root;

/// Index families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Client attribution code -> affiliate.
    AffiliateCode,
    /// Recruitment code -> affiliate.
    RecruitmentCode,
    /// Withdrawal id -> affiliate.
    Withdrawal,
    /// Confirmation reference -> withdrawal id.
    ConfirmationRef,
    /// Commission id -> affiliate.
    Commission,
    /// External origin event -> affiliates holding derived commissions.
    OriginEvent,
}

impl IndexKind {
    pub fn domain(&self) -> &'static str {
        match self {
            IndexKind::AffiliateCode => "index.affiliate_code",
            IndexKind::RecruitmentCode => "index.recruitment_code",
            IndexKind::Withdrawal => "index.withdrawal",
            IndexKind::ConfirmationRef => "index.confirmation_ref",
            IndexKind::Commission => "index.commission",
            IndexKind::OriginEvent => "index.origin_event",
        }
    }

    fn root(&self, key: &str) -> Uuid {
        stream_root(self.domain(), key)
    }
}

/// Result of claiming a unique index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The key now maps to the requested value (or already did).
    Owned,
    /// The key maps to a different value.
    Taken(String),
}

/// Handle over the index streams.
#[derive(Clone)]
pub struct Index {
    store: Arc<dyn EventStore>,
    backoff: ExponentialBuilder,
}

impl Index {
    pub fn new(store: Arc<dyn EventStore>, backoff: ExponentialBuilder) -> Self {
        Self { store, backoff }
    }

    /// Map `key` to `value` unless it already maps elsewhere.
    pub async fn claim_unique(&self, kind: IndexKind, key: &str, value: &str) -> Result<Claim> {
        let event = NewEvent::keyed(
            LedgerEvent::IndexLinked {
                value: value.to_string(),
            },
            format!("{}:{}", kind.domain(), key),
        );
        match self.store.add(kind.domain(), kind.root(key), 0, vec![event]).await {
            Ok(_) => Ok(Claim::Owned),
            Err(StorageError::SequenceConflict { .. }) | Err(StorageError::DuplicateKey { .. }) => {
                match self.lookup(kind, key).await? {
                    Some(existing) if existing == value => Ok(Claim::Owned),
                    Some(existing) => Ok(Claim::Taken(existing)),
                    None => Err(StorageError::SequenceConflict {
                        expected: 1,
                        actual: 0,
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Add `value` under `key`. Linking the same value twice is a no-op.
    pub async fn link(&self, kind: IndexKind, key: &str, value: &str) -> Result<()> {
        let root = kind.root(key);
        let idempotency_key = format!("{}:{}:{}", kind.domain(), key, value);
        let mut delays = self.backoff.build();

        loop {
            let next = self.store.get_next_sequence(kind.domain(), root).await?;
            let event = NewEvent::keyed(
                LedgerEvent::IndexLinked {
                    value: value.to_string(),
                },
                idempotency_key.clone(),
            );
            match self.store.add(kind.domain(), root, next, vec![event]).await {
                Ok(_) | Err(StorageError::DuplicateKey { .. }) => return Ok(()),
                Err(e) if e.is_retryable() => match delays.next() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// First value recorded under `key`.
    pub async fn lookup(&self, kind: IndexKind, key: &str) -> Result<Option<String>> {
        Ok(self.lookup_all(kind, key).await?.into_iter().next())
    }

    /// Every value recorded under `key`, in insertion order.
    pub async fn lookup_all(&self, kind: IndexKind, key: &str) -> Result<Vec<String>> {
        let pages = self.store.get(kind.domain(), kind.root(key)).await?;
        Ok(pages
            .into_iter()
            .filter_map(|page| match page.event {
                LedgerEvent::IndexLinked { value } => Some(value),
                _ => None,
            })
            .collect())
    }
}
