//! Leaderboard read model.
//!
//! Rankings are derived from the ledger on demand and cached per period. The
//! ledger bumps an earnings generation counter whenever it commits a payable
//! or paid change; a cached snapshot built at an older generation is stale.
//! Nothing here gates money, so a briefly stale board is acceptable.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::LeaderboardConfig;
use crate::ledger::{AffiliateState, CommissionLedger, LedgerError};
use crate::model::{AffiliateId, Cents, CommissionKind, CommissionStatus, Tier};
use crate::referral::ReferralGraph;

/// Ranking period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Month { year: i32, month: u32 },
    AllTime,
}

impl Period {
    pub fn month_of(at: DateTime<Utc>) -> Self {
        Period::Month {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        match self {
            Period::Month { year, month } => at.year() == *year && at.month() == *month,
            Period::AllTime => true,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            Period::AllTime => f.write_str("all-time"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    FirstConversion,
    Earnings100,
    Earnings500,
    Earnings1000,
    Earnings5000,
    Recruit1,
    Recruit10,
    Recruit25,
    Top10,
    Top3,
    Top1,
}

const EARNINGS_BADGES: [(Cents, Badge); 4] = [
    (10_000, Badge::Earnings100),
    (50_000, Badge::Earnings500),
    (100_000, Badge::Earnings1000),
    (500_000, Badge::Earnings5000),
];

const RECRUIT_BADGES: [(usize, Badge); 3] = [
    (1, Badge::Recruit1),
    (10, Badge::Recruit10),
    (25, Badge::Recruit25),
];

fn rank_badges(rank: usize) -> Vec<Badge> {
    [(1, Badge::Top1), (3, Badge::Top3), (10, Badge::Top10)]
        .into_iter()
        .filter(|(limit, _)| rank <= *limit)
        .map(|(_, badge)| badge)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub affiliate_id: AffiliateId,
    pub earnings: Cents,
    /// Direct-call conversions in the period.
    pub clients: usize,
    /// Direct (N1) recruits.
    pub recruits: usize,
    pub badges: Vec<Badge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardSnapshot {
    pub period: Period,
    pub generation: u64,
    pub total_participants: usize,
    pub entries: Vec<LeaderboardEntry>,
}

/// Full ranking for a period, before truncation.
#[derive(Debug, Clone)]
struct Ranking {
    generation: u64,
    entries: Vec<LeaderboardEntry>,
}

/// Counts earned and paid commissions the way every ranking does.
fn counts_toward_rank(status: CommissionStatus) -> bool {
    matches!(status, CommissionStatus::Payable | CommissionStatus::Paid)
}

pub struct LeaderboardAggregator {
    ledger: Arc<CommissionLedger>,
    graph: Arc<ReferralGraph>,
    config: LeaderboardConfig,
    generation: Arc<AtomicU64>,
    cache: RwLock<HashMap<Period, Ranking>>,
}

impl LeaderboardAggregator {
    pub fn new(
        ledger: Arc<CommissionLedger>,
        graph: Arc<ReferralGraph>,
        config: LeaderboardConfig,
    ) -> Self {
        let generation = ledger.earnings_generation();
        Self {
            ledger,
            graph,
            config,
            generation,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drop every cached ranking.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    async fn recruits_of(&self, affiliate_id: &AffiliateId) -> Result<usize, LedgerError> {
        Ok(self
            .graph
            .children_of(affiliate_id)
            .await?
            .iter()
            .filter(|edge| edge.tier == Tier::N1)
            .count())
    }

    async fn ranking(&self, period: Period) -> Result<Ranking, LedgerError> {
        let generation = self.generation.load(Ordering::SeqCst);
        if let Some(cached) = self.cache.read().await.get(&period) {
            if cached.generation == generation {
                return Ok(cached.clone());
            }
        }

        debug!(%period, generation, "Rebuilding leaderboard");
        let mut rows: Vec<(DateTime<Utc>, LeaderboardEntry)> = Vec::new();
        for state in self.ledger.affiliates().await? {
            let Some(account) = &state.account else {
                continue;
            };
            let in_period = state
                .commissions
                .iter()
                .filter(|c| period.contains(c.created_at) && counts_toward_rank(c.status));
            let (earnings, clients) = in_period.fold((0, 0), |(sum, clients), c| {
                let client = usize::from(c.kind == CommissionKind::DirectCall);
                (sum + c.amount, clients + client)
            });
            if earnings <= 0 {
                continue;
            }
            rows.push((
                account.registered_at,
                LeaderboardEntry {
                    rank: 0,
                    affiliate_id: account.affiliate_id.clone(),
                    earnings,
                    clients,
                    recruits: self.recruits_of(&account.affiliate_id).await?,
                    badges: Vec::new(),
                },
            ));
        }

        rows.sort_by(|(reg_a, a), (reg_b, b)| {
            b.earnings
                .cmp(&a.earnings)
                .then(reg_a.cmp(reg_b))
                .then(a.affiliate_id.cmp(&b.affiliate_id))
        });
        let entries: Vec<LeaderboardEntry> = rows
            .into_iter()
            .enumerate()
            .map(|(i, (_, mut entry))| {
                entry.rank = i + 1;
                entry.badges = rank_badges(entry.rank);
                entry
            })
            .collect();

        let ranking = Ranking {
            generation,
            entries,
        };
        self.cache.write().await.insert(period, ranking.clone());
        Ok(ranking)
    }

    /// Top affiliates for a period by payable plus paid earnings.
    ///
    /// Ties go to the earlier registration.
    pub async fn rank(&self, period: Period) -> Result<LeaderboardSnapshot, LedgerError> {
        let ranking = self.ranking(period).await?;
        let total_participants = ranking.entries.len();
        let mut entries = ranking.entries;
        entries.truncate(self.config.size);
        Ok(LeaderboardSnapshot {
            period,
            generation: ranking.generation,
            total_participants,
            entries,
        })
    }

    /// 1-based position of an affiliate, `None` when unranked.
    pub async fn position_of(
        &self,
        affiliate_id: &AffiliateId,
        period: Period,
    ) -> Result<Option<usize>, LedgerError> {
        Ok(self
            .ranking(period)
            .await?
            .entries
            .iter()
            .find(|entry| &entry.affiliate_id == affiliate_id)
            .map(|entry| entry.rank))
    }

    /// Milestone badges, plus ranking badges for the current month.
    pub async fn badges_for(
        &self,
        affiliate_id: &AffiliateId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Badge>, LedgerError> {
        let state: AffiliateState = self.ledger.state(affiliate_id).await?;
        let mut badges = Vec::new();

        let converted = state.commissions.iter().any(|c| {
            c.kind == CommissionKind::DirectCall
                && !matches!(c.status, CommissionStatus::Cancelled | CommissionStatus::ClawedBack)
        });
        if converted {
            badges.push(Badge::FirstConversion);
        }

        let lifetime = state.balance().total_earned();
        badges.extend(
            EARNINGS_BADGES
                .iter()
                .filter(|(threshold, _)| lifetime >= *threshold)
                .map(|(_, badge)| *badge),
        );

        let recruits = self.recruits_of(affiliate_id).await?;
        badges.extend(
            RECRUIT_BADGES
                .iter()
                .filter(|(threshold, _)| recruits >= *threshold)
                .map(|(_, badge)| *badge),
        );

        if let Some(rank) = self.position_of(affiliate_id, Period::month_of(now)).await? {
            badges.extend(rank_badges(rank));
        }
        Ok(badges)
    }
}
