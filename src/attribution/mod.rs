//! Last-click attribution.
//!
//! Each visitor has a stream of recorded clicks. The most recent click made
//! before an action is the active cookie; every click stays in the stream
//! for audit.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::events::LedgerEvent;
use crate::interfaces::event_store::{EventPage, NewEvent, StorageError};
use crate::model::{stream_root, AffiliateId, AttributionCookie, ClickContext};
use crate::repository::{Aggregate, Decision, IndexKind, Repository};

#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("Unknown affiliate code: {0}")]
    UnknownAffiliateCode(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Who receives credit for a visitor's action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Attributed(AffiliateId),
    /// No unexpired cookie. A valid outcome: nobody is credited.
    NoAttribution,
}

impl Attribution {
    pub fn affiliate(&self) -> Option<&AffiliateId> {
        match self {
            Attribution::Attributed(id) => Some(id),
            Attribution::NoAttribution => None,
        }
    }
}

/// Folded visitor stream.
#[derive(Debug, Clone, Default)]
pub struct VisitorClicks {
    history: Vec<AttributionCookie>,
}

impl VisitorClicks {
    /// The most recent click made at or before `at`.
    ///
    /// Clicks may be recorded out of order, so a click dated after the
    /// action never displaces the one the visitor actually followed. Among
    /// clicks with equal timestamps the one recorded last wins.
    pub fn latest_at(&self, at: DateTime<Utc>) -> Option<&AttributionCookie> {
        self.history
            .iter()
            .filter(|cookie| cookie.created_at <= at)
            .max_by_key(|cookie| cookie.created_at)
    }
}

impl Aggregate for VisitorClicks {
    const DOMAIN: &'static str = "attribution";

    fn apply(&mut self, page: &EventPage) {
        if let LedgerEvent::ClickRecorded { cookie } = &page.event {
            self.history.push(cookie.clone());
        }
    }
}

fn visitor_root(visitor_id: &str) -> uuid::Uuid {
    stream_root("visitor", visitor_id)
}

/// Resolves which affiliate receives credit for an anonymous visitor.
pub struct AttributionTracker {
    repo: Repository,
    cookie_days: u32,
}

impl AttributionTracker {
    pub fn new(repo: Repository, cookie_days: u32) -> Self {
        Self { repo, cookie_days }
    }

    /// Record a click, replacing the visitor's active cookie.
    pub async fn record_click(
        &self,
        visitor_id: &str,
        code: &str,
        now: DateTime<Utc>,
        context: Option<ClickContext>,
    ) -> Result<AttributionCookie, AttributionError> {
        let affiliate = self
            .repo
            .index()
            .lookup(IndexKind::AffiliateCode, code)
            .await?
            .ok_or_else(|| AttributionError::UnknownAffiliateCode(code.to_string()))?;

        let cookie = AttributionCookie {
            visitor_id: visitor_id.to_string(),
            affiliate_id: AffiliateId::new(affiliate),
            code: code.to_string(),
            created_at: now,
            expires_at: now + Duration::days(i64::from(self.cookie_days)),
            context,
        };

        self.repo
            .execute::<VisitorClicks, _, AttributionError, _>(visitor_root(visitor_id), |_| {
                Ok(Decision::Append(
                    vec![NewEvent::new(LedgerEvent::ClickRecorded {
                        cookie: cookie.clone(),
                    })],
                    (),
                ))
            })
            .await?;

        debug!(visitor_id, code, affiliate_id = %cookie.affiliate_id, "Click recorded");
        Ok(cookie)
    }

    /// The last click before `now`, if its cookie is still active.
    pub async fn active_cookie(
        &self,
        visitor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AttributionCookie>, AttributionError> {
        let loaded = self
            .repo
            .load::<VisitorClicks>(visitor_root(visitor_id))
            .await?;
        Ok(loaded
            .state
            .latest_at(now)
            .filter(|cookie| cookie.is_active(now))
            .cloned())
    }

    /// Affiliate credited for an action by `visitor_id` at `now`.
    pub async fn resolve(
        &self,
        visitor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Attribution, AttributionError> {
        match self.active_cookie(visitor_id, now).await? {
            Some(cookie) => Ok(Attribution::Attributed(cookie.affiliate_id)),
            None => {
                info!(visitor_id, "No attribution for visitor");
                Ok(Attribution::NoAttribution)
            }
        }
    }

    /// Every click recorded for the visitor, oldest first.
    pub async fn history(&self, visitor_id: &str) -> Result<Vec<AttributionCookie>, AttributionError> {
        let loaded = self
            .repo
            .load::<VisitorClicks>(visitor_root(visitor_id))
            .await?;
        Ok(loaded.state.history)
    }
}
