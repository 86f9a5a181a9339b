//! Read surface for the affiliate dashboard.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::leaderboard::{Badge, LeaderboardAggregator, LeaderboardSnapshot, Period};
use crate::ledger::{AffiliateAccount, Balance, CommissionLedger, LedgerError};
use crate::model::{AffiliateId, Cents, CommissionEvent, PaymentMethod, WithdrawalRequest};
use crate::withdrawal::{WithdrawalError, WithdrawalWorkflow};

/// Commissions shown on the summary.
pub const RECENT_COMMISSIONS: usize = 10;
/// Withdrawals shown on the summary.
pub const RECENT_WITHDRAWALS: usize = 5;
/// Largest page a history query returns.
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("Unknown affiliate: {0}")]
    UnknownAffiliate(AffiliateId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Withdrawal(#[from] WithdrawalError),
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardSummary {
    pub profile: AffiliateAccount,
    pub balance: Balance,
    /// Newest first.
    pub recent_commissions: Vec<CommissionEvent>,
    /// Newest first.
    pub recent_withdrawals: Vec<WithdrawalRequest>,
    pub badges: Vec<Badge>,
    pub current_rank: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardView {
    pub snapshot: LeaderboardSnapshot,
    pub viewer_rank: Option<usize>,
}

/// Offset pagination over newest-first history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub has_more: bool,
}

impl<T> HistoryPage<T> {
    /// Page of `items`, which arrive oldest first.
    fn newest_first(mut items: Vec<T>, page: PageRequest) -> Self {
        let total = items.len();
        items.reverse();
        let limit = page.limit.clamp(1, MAX_PAGE_SIZE);
        let items: Vec<T> = items.into_iter().skip(page.offset).take(limit).collect();
        let has_more = page.offset + items.len() < total;
        Self {
            items,
            total,
            has_more,
        }
    }
}

pub struct DashboardService {
    ledger: Arc<CommissionLedger>,
    withdrawals: Arc<WithdrawalWorkflow>,
    leaderboard: Arc<LeaderboardAggregator>,
}

impl DashboardService {
    pub fn new(
        ledger: Arc<CommissionLedger>,
        withdrawals: Arc<WithdrawalWorkflow>,
        leaderboard: Arc<LeaderboardAggregator>,
    ) -> Self {
        Self {
            ledger,
            withdrawals,
            leaderboard,
        }
    }

    pub async fn summary(
        &self,
        affiliate_id: &AffiliateId,
        now: DateTime<Utc>,
    ) -> Result<DashboardSummary, DashboardError> {
        let state = self.ledger.state(affiliate_id).await?;
        let profile = state
            .account
            .clone()
            .ok_or_else(|| DashboardError::UnknownAffiliate(affiliate_id.clone()))?;
        let balance = state.balance();

        let recent_commissions = state
            .commissions
            .iter()
            .rev()
            .take(RECENT_COMMISSIONS)
            .cloned()
            .collect();
        let recent_withdrawals = state
            .withdrawals
            .iter()
            .rev()
            .take(RECENT_WITHDRAWALS)
            .cloned()
            .collect();

        let badges = self.leaderboard.badges_for(affiliate_id, now).await?;
        let current_rank = self
            .leaderboard
            .position_of(affiliate_id, Period::month_of(now))
            .await?;

        Ok(DashboardSummary {
            profile,
            balance,
            recent_commissions,
            recent_withdrawals,
            badges,
            current_rank,
        })
    }

    pub async fn leaderboard(
        &self,
        period: Period,
        viewer: Option<&AffiliateId>,
    ) -> Result<LeaderboardView, DashboardError> {
        let snapshot = self.leaderboard.rank(period).await?;
        let viewer_rank = match viewer {
            Some(id) => self.leaderboard.position_of(id, period).await?,
            None => None,
        };
        Ok(LeaderboardView {
            snapshot,
            viewer_rank,
        })
    }

    pub async fn commission_history(
        &self,
        affiliate_id: &AffiliateId,
        page: PageRequest,
    ) -> Result<HistoryPage<CommissionEvent>, DashboardError> {
        let commissions = self.ledger.commissions_of(affiliate_id).await?;
        Ok(HistoryPage::newest_first(commissions, page))
    }

    pub async fn withdrawal_history(
        &self,
        affiliate_id: &AffiliateId,
        page: PageRequest,
    ) -> Result<HistoryPage<WithdrawalRequest>, DashboardError> {
        let withdrawals = self.withdrawals.withdrawals_of(affiliate_id).await?;
        Ok(HistoryPage::newest_first(withdrawals, page))
    }

    /// Withdrawal request from the dashboard.
    pub async fn request_withdrawal(
        &self,
        affiliate_id: &AffiliateId,
        amount: Cents,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, DashboardError> {
        Ok(self
            .withdrawals
            .request(affiliate_id, amount, method, now)
            .await?)
    }
}
