//! Aggregate repository.
//!
//! Loads an aggregate by folding its event stream and executes commands as
//! decide-then-append against the stream's next sequence. A concurrent writer
//! makes the append fail with a sequence conflict; the command is then
//! reloaded, re-decided, and retried with jittered backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::interfaces::event_store::{EventPage, EventStore, NewEvent, StorageError};

pub mod index;

pub use index::{Claim, Index, IndexKind};

/// State folded from one event stream.
pub trait Aggregate: Default + Send + Sync {
    /// Store domain the aggregate's streams live in.
    const DOMAIN: &'static str;

    fn apply(&mut self, page: &EventPage);
}

/// An aggregate together with the sequence its next append must carry.
#[derive(Debug, Clone)]
pub struct Loaded<A> {
    pub root: Uuid,
    pub state: A,
    pub next_sequence: u32,
}

impl<A> Loaded<A> {
    /// Whether the stream has any events.
    pub fn exists(&self) -> bool {
        self.next_sequence > 0
    }
}

/// Outcome of a decide step.
#[derive(Debug)]
pub enum Decision<T> {
    /// Append the events, then return the value.
    Append(Vec<NewEvent>, T),
    /// Nothing to write.
    Done(T),
}

/// Repository over the shared event store.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn EventStore>,
    backoff: ExponentialBuilder,
    earnings_generation: Arc<AtomicU64>,
}

impl Repository {
    pub fn new(store: Arc<dyn EventStore>, backoff: ExponentialBuilder) -> Self {
        Self {
            store,
            backoff,
            earnings_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        self.backoff
    }

    /// Lookup indexes sharing this repository's store.
    pub fn index(&self) -> Index {
        Index::new(self.store.clone(), self.backoff)
    }

    /// Counter bumped after every commit that changes payable or paid amounts.
    pub fn earnings_generation(&self) -> Arc<AtomicU64> {
        self.earnings_generation.clone()
    }

    /// Load an aggregate by folding its whole stream.
    pub async fn load<A: Aggregate>(&self, root: Uuid) -> Result<Loaded<A>, StorageError> {
        let pages = self.store.get(A::DOMAIN, root).await?;
        let mut state = A::default();
        for page in &pages {
            state.apply(page);
        }
        let next_sequence = pages.last().map(|p| p.sequence + 1).unwrap_or(0);
        Ok(Loaded {
            root,
            state,
            next_sequence,
        })
    }

    /// Run `decide` against the current state and append what it returns.
    ///
    /// `decide` may run several times; it must be free of side effects.
    pub async fn execute<A, T, E, F>(&self, root: Uuid, mut decide: F) -> Result<T, E>
    where
        A: Aggregate,
        E: From<StorageError>,
        F: FnMut(&Loaded<A>) -> Result<Decision<T>, E>,
    {
        let mut delays = self.backoff.build();
        let mut attempt = 0u32;

        loop {
            let loaded = self.load::<A>(root).await?;
            let (events, value) = match decide(&loaded)? {
                Decision::Done(value) => return Ok(value),
                Decision::Append(events, value) => (events, value),
            };

            match self
                .store
                .add(A::DOMAIN, root, loaded.next_sequence, events)
                .await
            {
                Ok(pages) => {
                    self.note_commit(&pages);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => match delays.next() {
                    Some(delay) => {
                        debug!(
                            domain = A::DOMAIN,
                            %root,
                            attempt,
                            error = %e,
                            "Sequence conflict, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        warn!(
                            domain = A::DOMAIN,
                            %root,
                            attempt,
                            "Sequence conflict retries exhausted"
                        );
                        return Err(e.into());
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn note_commit(&self, pages: &[EventPage]) {
        if pages.iter().any(|p| p.event.affects_earnings()) {
            self.earnings_generation.fetch_add(1, Ordering::SeqCst);
        }
    }
}
