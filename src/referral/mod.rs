//! Referral graph.
//!
//! Recruitment edges live in one graph stream so the ancestor check and the
//! insert commit atomically. Reads and edge decisions both run against a
//! cached projection of that stream. Each edge also owns a small guard stream that
//! records the one-time recruitment bonus.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use backon::BackoffBuilder;
use chrono::{DateTime, Months, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::LedgerEvent;
use crate::interfaces::event_store::{EventPage, EventStore, NewEvent, StorageError};
use crate::model::{stream_root, AffiliateId, CommissionId, ReferralEdge, Tier};
use crate::repository::{Aggregate, Decision, Loaded, Repository};

/// Errors returned by graph mutations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Edge {parent} -> {child} would create a referral cycle")]
    CycleDetected {
        parent: AffiliateId,
        child: AffiliateId,
    },

    #[error("Edge {parent} -> {child} already exists")]
    DuplicateEdge {
        parent: AffiliateId,
        child: AffiliateId,
    },

    #[error("{child} already has {tier} parent {existing}")]
    ParentConflict {
        child: AffiliateId,
        tier: Tier,
        existing: AffiliateId,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Folded graph stream.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    edges: Vec<ReferralEdge>,
    by_pair: HashMap<(AffiliateId, AffiliateId), usize>,
    by_child_tier: HashMap<(AffiliateId, Tier), usize>,
    by_parent: HashMap<AffiliateId, Vec<usize>>,
}

impl GraphState {
    pub fn edge(&self, parent: &AffiliateId, child: &AffiliateId) -> Option<&ReferralEdge> {
        self.by_pair
            .get(&(parent.clone(), child.clone()))
            .map(|&i| &self.edges[i])
    }

    pub fn parent_edge(&self, child: &AffiliateId, tier: Tier) -> Option<&ReferralEdge> {
        self.by_child_tier
            .get(&(child.clone(), tier))
            .map(|&i| &self.edges[i])
    }

    pub fn children_of(&self, parent: &AffiliateId) -> Vec<&ReferralEdge> {
        self.by_parent
            .get(parent)
            .map(|idx| idx.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Whether `candidate` is reachable upward from `of` along any edge.
    pub fn is_ancestor(&self, candidate: &AffiliateId, of: &AffiliateId) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([of.clone()]);
        while let Some(node) = queue.pop_front() {
            for tier in [Tier::N1, Tier::N2] {
                if let Some(edge) = self.parent_edge(&node, tier) {
                    if &edge.parent == candidate {
                        return true;
                    }
                    if seen.insert(edge.parent.clone()) {
                        queue.push_back(edge.parent.clone());
                    }
                }
            }
        }
        false
    }

    /// Validate a new edge against the current graph.
    fn check(&self, parent: &AffiliateId, child: &AffiliateId, tier: Tier) -> Result<(), GraphError> {
        if parent == child || self.is_ancestor(child, parent) {
            return Err(GraphError::CycleDetected {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        if self.edge(parent, child).is_some() {
            return Err(GraphError::DuplicateEdge {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        if let Some(existing) = self.parent_edge(child, tier) {
            return Err(GraphError::ParentConflict {
                child: child.clone(),
                tier,
                existing: existing.parent.clone(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, edge: ReferralEdge) {
        let i = self.edges.len();
        self.by_pair
            .insert((edge.parent.clone(), edge.child.clone()), i);
        self.by_child_tier.insert((edge.child.clone(), edge.tier), i);
        self.by_parent.entry(edge.parent.clone()).or_default().push(i);
        self.edges.push(edge);
    }
}

impl Aggregate for GraphState {
    const DOMAIN: &'static str = "referral";

    fn apply(&mut self, page: &EventPage) {
        if let LedgerEvent::EdgeCreated { edge } = &page.event {
            self.insert(edge.clone());
        }
    }
}

/// Per-edge guard stream.
#[derive(Debug, Clone, Default)]
pub struct EdgeGuard {
    pub bonus_commission: Option<CommissionId>,
}

impl Aggregate for EdgeGuard {
    const DOMAIN: &'static str = "referral.edge";

    fn apply(&mut self, page: &EventPage) {
        if let LedgerEvent::RecruitBonusFired { commission_id, .. } = &page.event {
            self.bonus_commission.get_or_insert(*commission_id);
        }
    }
}

fn graph_root() -> Uuid {
    stream_root("referral", "graph")
}

fn edge_root(parent: &AffiliateId, child: &AffiliateId) -> Uuid {
    stream_root("edge", &format!("{}->{}", parent, child))
}

/// Directed, time-bounded recruitment relationships.
pub struct ReferralGraph {
    repo: Repository,
    window_months: u32,
    cache: RwLock<Loaded<GraphState>>,
}

impl ReferralGraph {
    pub fn new(repo: Repository, window_months: u32) -> Self {
        Self {
            repo,
            window_months,
            cache: RwLock::new(Loaded {
                root: graph_root(),
                state: GraphState::default(),
                next_sequence: 0,
            }),
        }
    }

    fn make_edge(
        &self,
        parent: &AffiliateId,
        child: &AffiliateId,
        tier: Tier,
        at: DateTime<Utc>,
        fingerprint: Option<String>,
    ) -> ReferralEdge {
        let window_end = at
            .checked_add_months(Months::new(self.window_months))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        ReferralEdge {
            parent: parent.clone(),
            child: child.clone(),
            tier,
            created_at: at,
            window_end,
            fingerprint,
        }
    }

    /// Create one edge. The window ends `window_months` after `at`.
    pub async fn add_edge(
        &self,
        parent: &AffiliateId,
        child: &AffiliateId,
        tier: Tier,
        at: DateTime<Utc>,
        fingerprint: Option<String>,
    ) -> Result<ReferralEdge, GraphError> {
        let edge = self.make_edge(parent, child, tier, at, fingerprint);
        let edge = self
            .commit(|state| {
                state.check(parent, child, tier)?;
                Ok(Decision::Append(
                    vec![NewEvent::new(LedgerEvent::EdgeCreated { edge: edge.clone() })],
                    edge.clone(),
                ))
            })
            .await?;

        info!(%parent, %child, %tier, window_end = %edge.window_end, "Referral edge created");
        Ok(edge)
    }

    /// Create the N1 edge for a new recruit, plus the N2 edge from the
    /// parent's own N1 parent when one exists. Both commit together.
    pub async fn add_recruit(
        &self,
        parent: &AffiliateId,
        child: &AffiliateId,
        at: DateTime<Utc>,
        fingerprint: Option<String>,
    ) -> Result<Vec<ReferralEdge>, GraphError> {
        let edges = self
            .commit(|state| {
                state.check(parent, child, Tier::N1)?;
                let mut edges = vec![self.make_edge(parent, child, Tier::N1, at, fingerprint.clone())];

                if let Some(grand) = state.parent_edge(parent, Tier::N1) {
                    let grandparent = grand.parent.clone();
                    // A pre-existing N2 parent keeps its edge; the N1 edge still lands.
                    match state.check(&grandparent, child, Tier::N2) {
                        Ok(()) => edges.push(self.make_edge(
                            &grandparent,
                            child,
                            Tier::N2,
                            at,
                            fingerprint.clone(),
                        )),
                        Err(e) => debug!(error = %e, "Skipping derived N2 edge"),
                    }
                }

                let events = edges
                    .iter()
                    .map(|edge| NewEvent::new(LedgerEvent::EdgeCreated { edge: edge.clone() }))
                    .collect();
                Ok(Decision::Append(events, edges))
            })
            .await?;

        for edge in &edges {
            info!(parent = %edge.parent, child = %edge.child, tier = %edge.tier, "Referral edge created");
        }
        Ok(edges)
    }

    /// Apply graph events past the cached sequence.
    async fn catch_up(
        cache: &mut Loaded<GraphState>,
        store: &Arc<dyn EventStore>,
    ) -> Result<(), StorageError> {
        let pages = store
            .get_from(GraphState::DOMAIN, cache.root, cache.next_sequence)
            .await?;
        for page in &pages {
            cache.state.apply(page);
            cache.next_sequence = page.sequence + 1;
        }
        Ok(())
    }

    /// Catch the cached projection up with the graph stream.
    async fn snapshot(&self) -> Result<tokio::sync::RwLockReadGuard<'_, Loaded<GraphState>>, GraphError> {
        {
            let mut cache = self.cache.write().await;
            Self::catch_up(&mut cache, self.repo.store()).await?;
        }
        Ok(self.cache.read().await)
    }

    /// Decide against the cached projection and append to the graph stream.
    ///
    /// Every edge lives in the one graph stream, so the cycle check always
    /// sees the whole graph and registrations are serialized across all
    /// affiliates. The cache write lock is held through the append: writers
    /// in this process queue on it, and only a writer in another process
    /// surfaces as a sequence conflict, which catches up and retries.
    async fn commit<T, F>(&self, mut decide: F) -> Result<T, GraphError>
    where
        F: FnMut(&GraphState) -> Result<Decision<T>, GraphError>,
    {
        let store = self.repo.store();
        let mut delays = self.repo.backoff().build();
        loop {
            let mut cache = self.cache.write().await;
            Self::catch_up(&mut cache, store).await?;
            let (events, value) = match decide(&cache.state)? {
                Decision::Done(value) => return Ok(value),
                Decision::Append(events, value) => (events, value),
            };

            match store
                .add(GraphState::DOMAIN, cache.root, cache.next_sequence, events)
                .await
            {
                Ok(pages) => {
                    for page in &pages {
                        cache.state.apply(page);
                        cache.next_sequence = page.sequence + 1;
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    drop(cache);
                    match delays.next() {
                        Some(delay) => {
                            debug!(error = %e, "Graph stream moved, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn edge(
        &self,
        parent: &AffiliateId,
        child: &AffiliateId,
    ) -> Result<Option<ReferralEdge>, GraphError> {
        Ok(self.snapshot().await?.state.edge(parent, child).cloned())
    }

    /// Whether `at` falls inside the edge's window. No edge means false.
    pub async fn is_within_window(
        &self,
        parent: &AffiliateId,
        child: &AffiliateId,
        at: DateTime<Utc>,
    ) -> Result<bool, GraphError> {
        Ok(self
            .edge(parent, child)
            .await?
            .is_some_and(|edge| edge.is_within_window(at)))
    }

    /// Ancestor edges of `affiliate` up to `max_tier`, nearest first.
    pub async fn ancestors_of(
        &self,
        affiliate: &AffiliateId,
        max_tier: Tier,
    ) -> Result<Vec<ReferralEdge>, GraphError> {
        let snapshot = self.snapshot().await?;
        Ok([Tier::N1, Tier::N2]
            .into_iter()
            .filter(|tier| *tier <= max_tier)
            .filter_map(|tier| snapshot.state.parent_edge(affiliate, tier).cloned())
            .collect())
    }

    pub async fn children_of(&self, parent: &AffiliateId) -> Result<Vec<ReferralEdge>, GraphError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .state
            .children_of(parent)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Record the bonus for an edge. Returns false when one was already recorded.
    pub async fn mark_bonus_fired(
        &self,
        parent: &AffiliateId,
        child: &AffiliateId,
        commission_id: CommissionId,
        at: DateTime<Utc>,
    ) -> Result<bool, GraphError> {
        let event = LedgerEvent::RecruitBonusFired {
            parent: parent.clone(),
            child: child.clone(),
            commission_id,
            at,
        };
        self.repo
            .execute::<EdgeGuard, _, GraphError, _>(edge_root(parent, child), |loaded| {
                if loaded.state.bonus_commission.is_some() {
                    return Ok(Decision::Done(false));
                }
                Ok(Decision::Append(vec![NewEvent::new(event.clone())], true))
            })
            .await
    }

    pub async fn bonus_fired(
        &self,
        parent: &AffiliateId,
        child: &AffiliateId,
    ) -> Result<bool, GraphError> {
        let loaded = self
            .repo
            .load::<EdgeGuard>(edge_root(parent, child))
            .await?;
        Ok(loaded.state.bonus_commission.is_some())
    }
}
