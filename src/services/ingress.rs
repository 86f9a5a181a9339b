//! Inbound event handling.
//!
//! Each handler takes one external event, resolves who is involved and
//! hands the money side to the ledger. All handlers are idempotent on their
//! source event id, so at-least-once delivery is fine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::attribution::{AttributionError, AttributionTracker};
use crate::fraud::FraudGate;
use crate::ledger::{CommissionLedger, CreditOutcome, LedgerError, Referrer, RefundEffect};
use crate::model::{
    AffiliateId, AttributionCookie, Cents, ClickContext, ReferralEdge, Tier, WithdrawalId,
    WithdrawalRequest,
};
use crate::referral::{GraphError, ReferralGraph};
use crate::withdrawal::{WithdrawalError, WithdrawalWorkflow};

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("Unknown recruitment code: {0}")]
    UnknownRecruitmentCode(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Attribution(#[from] AttributionError),

    #[error(transparent)]
    Withdrawal(#[from] WithdrawalError),
}

/// A paid client call finished.
#[derive(Debug, Clone)]
pub struct CallCompleted {
    pub source_event_id: String,
    pub referrer: Referrer,
    /// Amount the client paid. Commissions are fixed per program; this is
    /// only recorded in the log.
    pub amount: Cents,
    /// Client account, when known. Used for self-referral screening.
    pub client_id: Option<AffiliateId>,
    /// Provider who took the call. Their recruiters earn per call.
    pub provider_id: Option<AffiliateId>,
    pub at: DateTime<Utc>,
}

/// Commissions a call produced.
#[derive(Debug, Clone, Default)]
pub struct CallOutcome {
    pub direct: Option<CreditOutcome>,
    pub recruiters: Vec<CreditOutcome>,
}

/// A new affiliate signed up through someone's recruitment link.
#[derive(Debug, Clone)]
pub struct RecruitRegistered {
    pub parent_code: String,
    pub child_id: AffiliateId,
    pub tier: Tier,
    pub at: DateTime<Utc>,
    /// Raw device fingerprint or client address. Stored hashed.
    pub fingerprint: Option<String>,
}

pub struct IngressService {
    ledger: Arc<CommissionLedger>,
    graph: Arc<ReferralGraph>,
    attribution: Arc<AttributionTracker>,
    fraud: Arc<FraudGate>,
    withdrawals: Arc<WithdrawalWorkflow>,
}

impl IngressService {
    pub fn new(
        ledger: Arc<CommissionLedger>,
        graph: Arc<ReferralGraph>,
        attribution: Arc<AttributionTracker>,
        fraud: Arc<FraudGate>,
        withdrawals: Arc<WithdrawalWorkflow>,
    ) -> Self {
        Self {
            ledger,
            graph,
            attribution,
            fraud,
            withdrawals,
        }
    }

    /// Credit the referrer of the call and, when a provider took it, the
    /// provider's recruiters.
    ///
    /// The two sides are independent: a rejected or inactive referrer
    /// leaves the recruiter credits untouched.
    #[tracing::instrument(
        name = "ingress.call_completed",
        skip_all,
        fields(source_event_id = %event.source_event_id, amount = event.amount)
    )]
    pub async fn call_completed(&self, event: CallCompleted) -> Result<CallOutcome, IngressError> {
        let direct = self.ledger.credit_direct_call(
            &event.source_event_id,
            &event.referrer,
            event.client_id.as_ref(),
            event.at,
        );
        let recruiters = async {
            match &event.provider_id {
                Some(provider) => {
                    self.ledger
                        .credit_recruiters(&event.source_event_id, provider, event.at)
                        .await
                }
                None => Ok(Vec::new()),
            }
        };
        let (direct, recruiters) = futures::join!(direct, recruiters);

        let direct = match direct {
            Ok(direct) => direct,
            Err(LedgerError::CreditRejected { reason }) => {
                warn!(%reason, "Direct credit rejected");
                None
            }
            Err(LedgerError::AccountInactive { affiliate_id, .. }) => {
                debug!(%affiliate_id, "Inactive referrer skipped");
                None
            }
            Err(LedgerError::UnknownAffiliate(affiliate_id)) => {
                warn!(%affiliate_id, "Referrer has no account");
                None
            }
            Err(e) => return Err(e.into()),
        };
        let recruiters = recruiters?;

        debug!(
            direct = direct.is_some(),
            recruiters = recruiters.len(),
            "Call processed"
        );
        Ok(CallOutcome { direct, recruiters })
    }

    /// Cancel or claw back every commission produced by the refunded event.
    pub async fn refund_issued(
        &self,
        source_event_id: &str,
        original_source_event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<RefundEffect>, IngressError> {
        Ok(self
            .ledger
            .apply_refund(source_event_id, original_source_event_id, at)
            .await?)
    }

    /// Attach a new recruit to the owner of the recruitment code.
    ///
    /// An N1 registration also derives the N2 edge. Replaying the same
    /// registration returns the edges already recorded.
    #[tracing::instrument(
        name = "ingress.recruit_registered",
        skip_all,
        fields(parent_code = %event.parent_code, child = %event.child_id, tier = %event.tier)
    )]
    pub async fn recruit_registered(
        &self,
        event: RecruitRegistered,
    ) -> Result<Vec<ReferralEdge>, IngressError> {
        let parent = self
            .ledger
            .affiliate_for_recruitment_code(&event.parent_code)
            .await?
            .ok_or_else(|| IngressError::UnknownRecruitmentCode(event.parent_code.clone()))?;

        if let Some(existing) = self.graph.edge(&parent, &event.child_id).await? {
            debug!(%parent, "Recruit already registered");
            return Ok(vec![existing]);
        }

        let fingerprint = match &event.fingerprint {
            Some(raw) => Some(self.fraud.record_device(&event.child_id, raw, event.at).await?),
            None => None,
        };

        let edges = match event.tier {
            Tier::N1 => {
                self.graph
                    .add_recruit(&parent, &event.child_id, event.at, fingerprint)
                    .await?
            }
            tier => vec![
                self.graph
                    .add_edge(&parent, &event.child_id, tier, event.at, fingerprint)
                    .await?,
            ],
        };
        info!(%parent, edges = edges.len(), "Recruit registered");
        Ok(edges)
    }

    pub async fn record_click(
        &self,
        visitor_id: &str,
        affiliate_code: &str,
        at: DateTime<Utc>,
        context: Option<ClickContext>,
    ) -> Result<AttributionCookie, IngressError> {
        Ok(self
            .attribution
            .record_click(visitor_id, affiliate_code, at, context)
            .await?)
    }

    /// The affiliate approved the withdrawal on the confirmation channel.
    pub async fn confirmed(
        &self,
        confirmation_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, IngressError> {
        Ok(self.withdrawals.confirmed_by_ref(confirmation_ref, at).await?)
    }

    /// The affiliate declined the withdrawal on the confirmation channel.
    pub async fn cancelled(
        &self,
        confirmation_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, IngressError> {
        Ok(self.withdrawals.cancelled_by_ref(confirmation_ref, at).await?)
    }

    /// Deferred settlement reported by the payout rail.
    pub async fn payout_settled(
        &self,
        withdrawal_id: WithdrawalId,
        payout_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, IngressError> {
        Ok(self.withdrawals.settle(withdrawal_id, payout_ref, at).await?)
    }
}
