//! Commission ledger.
//!
//! The single source of truth for commission lifecycle. Every commission is an
//! event in its affiliate's stream; status and balance are folded from the log.
//!
//! Idempotency rests on the store's globally unique event key: a credit carries
//! `commission:{source_event_id}`, so a replayed or concurrently duplicated
//! external event can never land twice, even across affiliate streams.

mod balance;
mod state;

pub use balance::Balance;
pub use state::{AffiliateAccount, AffiliateState};

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attribution::{AttributionError, AttributionTracker};
use crate::config::{LedgerConfig, ProgramsConfig};
use crate::events::LedgerEvent;
use crate::fraud::{FraudGate, ScreenContext, Verdict};
use crate::interfaces::event_store::{NewEvent, StorageError};
use crate::model::{
    AccountStatus, AffiliateId, AttributionCookie, Cents, CommissionEvent, CommissionId,
    CommissionKind, CommissionStatus, KycStatus, PaymentDetails, ProgramType, Tier,
    WithdrawalRequest,
};
use crate::referral::{GraphError, ReferralGraph};
use crate::repository::{Aggregate, Claim, Decision, IndexKind, Repository};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Unknown affiliate: {0}")]
    UnknownAffiliate(AffiliateId),

    #[error("Unknown affiliate code: {0}")]
    UnknownAffiliateCode(String),

    #[error("Affiliate {0} is already registered")]
    AlreadyRegistered(AffiliateId),

    #[error("Code {code} is already taken by {owner}")]
    CodeTaken { code: String, owner: String },

    #[error("Affiliate {affiliate_id} is {status:?}")]
    AccountInactive {
        affiliate_id: AffiliateId,
        status: AccountStatus,
    },

    #[error("Currency mismatch: ledger is {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("Commission amount must be positive, got {0}")]
    InvalidAmount(Cents),

    #[error("Credit rejected: {reason}")]
    CreditRejected { reason: String },

    #[error("Unknown commission: {0}")]
    UnknownCommission(CommissionId),

    #[error("Commission {commission_id} is {status:?}; cannot {action}")]
    InvalidTransition {
        commission_id: CommissionId,
        status: CommissionStatus,
        action: &'static str,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Attribution(#[from] AttributionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A request to credit one commission.
#[derive(Debug, Clone)]
pub struct CreditRequest {
    /// Unique per commission. Replays with the same id are no-ops.
    pub source_event_id: String,
    /// External event the commission derives from. Refunds match on it.
    pub origin_event_id: String,
    pub affiliate_id: AffiliateId,
    pub kind: CommissionKind,
    pub amount: Cents,
    pub currency: String,
    pub at: DateTime<Utc>,
    pub actor_id: Option<AffiliateId>,
    pub recruit_id: Option<AffiliateId>,
    pub click: Option<AttributionCookie>,
}

impl CreditRequest {
    pub fn new(
        source_event_id: impl Into<String>,
        affiliate_id: AffiliateId,
        kind: CommissionKind,
        amount: Cents,
        currency: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let source_event_id = source_event_id.into();
        Self {
            origin_event_id: source_event_id.clone(),
            source_event_id,
            affiliate_id,
            kind,
            amount,
            currency: currency.into(),
            at,
            actor_id: None,
            recruit_id: None,
            click: None,
        }
    }

    pub fn with_origin(mut self, origin_event_id: impl Into<String>) -> Self {
        self.origin_event_id = origin_event_id.into();
        self
    }

    pub fn with_actor(mut self, actor_id: Option<AffiliateId>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn with_recruit(mut self, recruit_id: AffiliateId) -> Self {
        self.recruit_id = Some(recruit_id);
        self
    }

    pub fn with_click(mut self, click: Option<AttributionCookie>) -> Self {
        self.click = click;
        self
    }
}

/// Result of a credit call.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditOutcome {
    pub commission: CommissionEvent,
    /// False when the source event had already been credited.
    pub created: bool,
}

/// Who referred a completed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Referrer {
    /// Anonymous visitor, resolved through the attribution cookie.
    Visitor(String),
    /// Affiliate known to the caller.
    Affiliate(AffiliateId),
}

/// What a refund did to one commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Cancelled,
    ClawedBack,
    /// Refund arrived after the clawback window. No ledger effect.
    ClawbackWindowExpired,
    /// Already cancelled or clawed back.
    AlreadyReversed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundEffect {
    pub affiliate_id: AffiliateId,
    pub commission_id: CommissionId,
    pub outcome: RefundOutcome,
}

/// Counts from one validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub validated: usize,
    pub flagged: usize,
    pub cancelled: usize,
    pub bonuses: usize,
}

impl std::ops::AddAssign for ValidationReport {
    fn add_assign(&mut self, other: Self) {
        self.validated += other.validated;
        self.flagged += other.flagged;
        self.cancelled += other.cancelled;
        self.bonuses += other.bonuses;
    }
}

fn credit_key(source_event_id: &str) -> String {
    format!("commission:{source_event_id}")
}

fn require_active(state: &AffiliateState, affiliate_id: &AffiliateId) -> Result<(), LedgerError> {
    let account = state
        .account
        .as_ref()
        .ok_or_else(|| LedgerError::UnknownAffiliate(affiliate_id.clone()))?;
    if account.status != AccountStatus::Active {
        return Err(LedgerError::AccountInactive {
            affiliate_id: affiliate_id.clone(),
            status: account.status,
        });
    }
    Ok(())
}

pub struct CommissionLedger {
    repo: Repository,
    graph: Arc<ReferralGraph>,
    attribution: Arc<AttributionTracker>,
    fraud: Arc<FraudGate>,
    config: LedgerConfig,
    programs: ProgramsConfig,
}

impl CommissionLedger {
    pub fn new(
        repo: Repository,
        graph: Arc<ReferralGraph>,
        attribution: Arc<AttributionTracker>,
        fraud: Arc<FraudGate>,
        config: LedgerConfig,
        programs: ProgramsConfig,
    ) -> Self {
        Self {
            repo,
            graph,
            attribution,
            fraud,
            config,
            programs,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn programs(&self) -> &ProgramsConfig {
        &self.programs
    }

    /// Bumped whenever payable or paid amounts change.
    pub fn earnings_generation(&self) -> Arc<AtomicU64> {
        self.repo.earnings_generation()
    }

    // ---- Accounts ----

    /// Register an affiliate and claim its attribution and recruitment codes.
    pub async fn register_affiliate(
        &self,
        affiliate_id: &AffiliateId,
        program: ProgramType,
        client_code: &str,
        recruitment_code: &str,
        at: DateTime<Utc>,
    ) -> Result<AffiliateAccount, LedgerError> {
        let index = self.repo.index();
        for (kind, code) in [
            (IndexKind::AffiliateCode, client_code),
            (IndexKind::RecruitmentCode, recruitment_code),
        ] {
            if let Claim::Taken(owner) = index.claim_unique(kind, code, affiliate_id.as_str()).await? {
                return Err(LedgerError::CodeTaken {
                    code: code.to_string(),
                    owner,
                });
            }
        }

        let event = LedgerEvent::AccountRegistered {
            affiliate_id: affiliate_id.clone(),
            program,
            client_code: client_code.to_string(),
            recruitment_code: recruitment_code.to_string(),
            registered_at: at,
        };
        self.repo
            .execute::<AffiliateState, _, LedgerError, _>(affiliate_id.root(), |loaded| {
                if loaded.state.account.is_some() {
                    return Err(LedgerError::AlreadyRegistered(affiliate_id.clone()));
                }
                Ok(Decision::Append(vec![NewEvent::new(event.clone())], ()))
            })
            .await?;

        info!(%affiliate_id, program = program.as_str(), client_code, "Affiliate registered");
        self.account(affiliate_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownAffiliate(affiliate_id.clone()))
    }

    /// Append an account event when `decide` asks for one.
    async fn update_account<F>(&self, affiliate_id: &AffiliateId, decide: F) -> Result<(), LedgerError>
    where
        F: Fn(&AffiliateAccount) -> Option<LedgerEvent>,
    {
        self.repo
            .execute::<AffiliateState, _, LedgerError, _>(affiliate_id.root(), |loaded| {
                let account = loaded
                    .state
                    .account
                    .as_ref()
                    .ok_or_else(|| LedgerError::UnknownAffiliate(affiliate_id.clone()))?;
                Ok(match decide(account) {
                    Some(event) => Decision::Append(vec![NewEvent::new(event)], ()),
                    None => Decision::Done(()),
                })
            })
            .await
    }

    pub async fn set_status(
        &self,
        affiliate_id: &AffiliateId,
        status: AccountStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.update_account(affiliate_id, |account| {
            (account.status != status).then(|| LedgerEvent::AccountStatusChanged {
                status,
                reason: reason.clone(),
                at,
            })
        })
        .await?;
        info!(%affiliate_id, ?status, "Account status changed");
        Ok(())
    }

    /// Cache a positive identity verification on the account.
    pub async fn record_kyc_verified(
        &self,
        affiliate_id: &AffiliateId,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.update_account(affiliate_id, |account| {
            (account.kyc != KycStatus::Verified).then_some(LedgerEvent::KycVerified { at })
        })
        .await
    }

    pub async fn link_confirmation_channel(
        &self,
        affiliate_id: &AffiliateId,
        handle: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.update_account(affiliate_id, |account| {
            (account.confirmation_handle.as_deref() != Some(handle)).then(|| {
                LedgerEvent::ConfirmationChannelLinked {
                    handle: handle.to_string(),
                    at,
                }
            })
        })
        .await
    }

    pub async fn update_payment_details(
        &self,
        affiliate_id: &AffiliateId,
        details: PaymentDetails,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.update_account(affiliate_id, |account| {
            (account.payment_details.as_ref() != Some(&details)).then(|| {
                LedgerEvent::PaymentDetailsUpdated {
                    details: details.clone(),
                    at,
                }
            })
        })
        .await
    }

    pub async fn account(
        &self,
        affiliate_id: &AffiliateId,
    ) -> Result<Option<AffiliateAccount>, LedgerError> {
        Ok(self.state(affiliate_id).await?.account)
    }

    /// Folded affiliate stream.
    pub async fn state(&self, affiliate_id: &AffiliateId) -> Result<AffiliateState, LedgerError> {
        Ok(self
            .repo
            .load::<AffiliateState>(affiliate_id.root())
            .await?
            .state)
    }

    /// Every registered affiliate.
    pub async fn affiliates(&self) -> Result<Vec<AffiliateState>, LedgerError> {
        let roots = self.repo.store().list_roots(AffiliateState::DOMAIN).await?;
        let mut states = Vec::with_capacity(roots.len());
        for root in roots {
            let loaded = self.repo.load::<AffiliateState>(root).await?;
            if loaded.state.account.is_some() {
                states.push(loaded.state);
            }
        }
        Ok(states)
    }

    pub async fn affiliate_for_code(&self, code: &str) -> Result<Option<AffiliateId>, LedgerError> {
        Ok(self
            .repo
            .index()
            .lookup(IndexKind::AffiliateCode, code)
            .await?
            .map(AffiliateId::new))
    }

    pub async fn affiliate_for_recruitment_code(
        &self,
        code: &str,
    ) -> Result<Option<AffiliateId>, LedgerError> {
        Ok(self
            .repo
            .index()
            .lookup(IndexKind::RecruitmentCode, code)
            .await?
            .map(AffiliateId::new))
    }

    // ---- Crediting ----

    async fn existing_credit(
        &self,
        source_event_id: &str,
    ) -> Result<Option<CommissionEvent>, LedgerError> {
        let Some(keyed) = self.repo.store().find_by_key(&credit_key(source_event_id)).await? else {
            return Ok(None);
        };
        let loaded = self.repo.load::<AffiliateState>(keyed.root).await?;
        Ok(loaded.state.commission_by_source(source_event_id).cloned())
    }

    /// Credit one commission in `pending`.
    ///
    /// A source event that was already credited returns the existing
    /// commission unchanged. A `Blocked` screening verdict creates nothing.
    #[tracing::instrument(
        name = "ledger.credit",
        skip_all,
        fields(source_event_id = %req.source_event_id, affiliate_id = %req.affiliate_id)
    )]
    pub async fn credit(&self, req: CreditRequest) -> Result<CreditOutcome, LedgerError> {
        if let Some(existing) = self.existing_credit(&req.source_event_id).await? {
            debug!("Source event already credited");
            return Ok(CreditOutcome {
                commission: existing,
                created: false,
            });
        }
        if req.currency != self.config.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: self.config.currency.clone(),
                actual: req.currency,
            });
        }
        if req.amount <= 0 {
            return Err(LedgerError::InvalidAmount(req.amount));
        }

        let root = req.affiliate_id.root();
        let loaded = self.repo.load::<AffiliateState>(root).await?;
        require_active(&loaded.state, &req.affiliate_id)?;

        let window = Duration::seconds(self.fraud.config().velocity_window_secs as i64);
        let mut ctx = ScreenContext::new(req.affiliate_id.clone(), req.kind, req.at);
        ctx.actor_id = req.actor_id.clone();
        ctx.recruit_id = req.recruit_id.clone();
        ctx.click = req.click.clone();
        ctx.recent_credits = loaded.state.credits_between(req.at - window, req.at);

        let flag = match self.fraud.screen(&ctx).await? {
            Verdict::Clear => None,
            Verdict::Flagged(reason) => Some(reason),
            Verdict::Blocked(reason) => return Err(LedgerError::CreditRejected { reason }),
        };

        // Indexes first: a dangling index entry is harmless, a missing one is not.
        let commission_id = Uuid::new_v4();
        let index = self.repo.index();
        index
            .link(
                IndexKind::Commission,
                &commission_id.to_string(),
                req.affiliate_id.as_str(),
            )
            .await?;
        index
            .link(
                IndexKind::OriginEvent,
                &req.origin_event_id,
                req.affiliate_id.as_str(),
            )
            .await?;

        let commission = CommissionEvent {
            id: commission_id,
            affiliate_id: req.affiliate_id.clone(),
            kind: req.kind,
            amount: req.amount,
            currency: req.currency.clone(),
            source_event_id: req.source_event_id.clone(),
            origin_event_id: req.origin_event_id.clone(),
            actor_id: req.actor_id.clone(),
            recruit_id: req.recruit_id.clone(),
            status: CommissionStatus::Pending,
            flag: flag.clone(),
            created_at: req.at,
            validated_at: None,
            payable_at: None,
            paid_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            clawback_at: None,
            withdrawal_id: None,
            payout_ref: None,
        };
        let event = NewEvent::keyed(
            LedgerEvent::CommissionCredited {
                commission_id,
                kind: req.kind,
                amount: req.amount,
                currency: req.currency.clone(),
                source_event_id: req.source_event_id.clone(),
                origin_event_id: req.origin_event_id.clone(),
                actor_id: req.actor_id.clone(),
                recruit_id: req.recruit_id.clone(),
                flag,
                at: req.at,
            },
            credit_key(&req.source_event_id),
        );

        let result = self
            .repo
            .execute::<AffiliateState, _, LedgerError, _>(root, |loaded| {
                require_active(&loaded.state, &req.affiliate_id)?;
                if let Some(existing) = loaded.state.commission_by_source(&req.source_event_id) {
                    return Ok(Decision::Done(CreditOutcome {
                        commission: existing.clone(),
                        created: false,
                    }));
                }
                Ok(Decision::Append(
                    vec![event.clone()],
                    CreditOutcome {
                        commission: commission.clone(),
                        created: true,
                    },
                ))
            })
            .await;

        match result {
            Ok(outcome) => {
                if outcome.created {
                    info!(
                        commission_id = %outcome.commission.id,
                        kind = req.kind.as_str(),
                        amount = req.amount,
                        flagged = outcome.commission.flag.is_some(),
                        "Commission credited"
                    );
                }
                Ok(outcome)
            }
            Err(LedgerError::Storage(StorageError::DuplicateKey { .. })) => {
                debug!("Concurrent credit of the same source event");
                let commission = self
                    .existing_credit(&req.source_event_id)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::Storage(StorageError::DuplicateKey {
                            key: credit_key(&req.source_event_id),
                        })
                    })?;
                Ok(CreditOutcome {
                    commission,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Credit the referrer of a completed client call with the program's
    /// fixed direct amount. `None` when nobody is attributed.
    pub async fn credit_direct_call(
        &self,
        source_event_id: &str,
        referrer: &Referrer,
        client_id: Option<&AffiliateId>,
        at: DateTime<Utc>,
    ) -> Result<Option<CreditOutcome>, LedgerError> {
        let (affiliate_id, click) = match referrer {
            Referrer::Affiliate(id) => (id.clone(), None),
            Referrer::Visitor(visitor_id) => {
                match self.attribution.active_cookie(visitor_id, at).await? {
                    Some(cookie) => (cookie.affiliate_id.clone(), Some(cookie)),
                    None => {
                        info!(source_event_id, visitor_id, "No attribution; no direct credit");
                        return Ok(None);
                    }
                }
            }
        };

        let account = self
            .account(&affiliate_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownAffiliate(affiliate_id.clone()))?;
        let amount = self.programs.for_program(account.program).direct_call;
        if amount == 0 {
            return Ok(None);
        }

        let req = CreditRequest::new(
            source_event_id,
            affiliate_id,
            CommissionKind::DirectCall,
            amount,
            self.config.currency.clone(),
            at,
        )
        .with_actor(client_id.cloned())
        .with_click(click);
        self.credit(req).await.map(Some)
    }

    /// Credit the N1 and N2 recruiters of a provider that completed a call.
    ///
    /// Recruiters whose window has closed get nothing. A blocked recruiter
    /// does not stop the others.
    pub async fn credit_recruiters(
        &self,
        source_event_id: &str,
        recruit: &AffiliateId,
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditOutcome>, LedgerError> {
        let kind = CommissionKind::ProviderRecruitCall;
        let mut outcomes = Vec::new();

        for edge in self.graph.ancestors_of(recruit, Tier::N2).await? {
            if !self.graph.is_within_window(&edge.parent, recruit, at).await? {
                debug!(parent = %edge.parent, %recruit, tier = %edge.tier, "Recruitment window closed");
                continue;
            }
            let Some(account) = self.account(&edge.parent).await? else {
                continue;
            };
            let amount = self
                .programs
                .for_program(account.program)
                .provider_recruit_call
                .for_tier(edge.tier);
            if amount == 0 {
                continue;
            }

            let req = CreditRequest::new(
                format!("{source_event_id}:{}:{}", kind.as_str(), edge.parent),
                edge.parent.clone(),
                kind,
                amount,
                self.config.currency.clone(),
                at,
            )
            .with_origin(source_event_id)
            .with_recruit(recruit.clone());

            match self.credit(req).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(LedgerError::CreditRejected { reason }) => {
                    warn!(parent = %edge.parent, %recruit, %reason, "Recruiter credit rejected");
                }
                Err(LedgerError::AccountInactive { affiliate_id, .. }) => {
                    debug!(%affiliate_id, "Inactive recruiter skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// Fire the one-time recruitment bonus for each recruiter of `child` once
    /// the child's validated, payable, and paid earnings reach the threshold.
    ///
    /// Safe to call any number of times concurrently: the bonus source event
    /// is deterministic per edge, so at most one bonus commission can exist.
    pub async fn check_recruitment_bonus(
        &self,
        child: &AffiliateId,
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditOutcome>, LedgerError> {
        let earned = self.state(child).await?.earned();
        if earned < self.config.recruit_bonus_threshold {
            return Ok(Vec::new());
        }

        let kind = CommissionKind::AdminRecruitBonus;
        let mut outcomes = Vec::new();
        for edge in self.graph.ancestors_of(child, Tier::N2).await? {
            if !self.graph.is_within_window(&edge.parent, child, at).await? {
                debug!(parent = %edge.parent, %child, "Bonus window closed");
                continue;
            }
            if self.graph.bonus_fired(&edge.parent, child).await? {
                continue;
            }
            let Some(account) = self.account(&edge.parent).await? else {
                continue;
            };
            let amount = self
                .programs
                .for_program(account.program)
                .recruit_bonus
                .for_tier(edge.tier);
            if amount == 0 {
                continue;
            }

            let source = format!("{}:{}:{}", kind.as_str(), edge.parent, child);
            let req = CreditRequest::new(
                source,
                edge.parent.clone(),
                kind,
                amount,
                self.config.currency.clone(),
                at,
            )
            .with_recruit(child.clone());

            match self.credit(req).await {
                Ok(outcome) => {
                    self.graph
                        .mark_bonus_fired(&edge.parent, child, outcome.commission.id, at)
                        .await?;
                    if outcome.created {
                        info!(parent = %edge.parent, %child, earned, "Recruitment bonus fired");
                        outcomes.push(outcome);
                    }
                }
                Err(LedgerError::CreditRejected { reason }) => {
                    warn!(parent = %edge.parent, %child, %reason, "Recruitment bonus rejected");
                }
                Err(LedgerError::AccountInactive { affiliate_id, .. }) => {
                    debug!(%affiliate_id, "Inactive recruiter skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    // ---- Scheduled transitions ----

    /// Validate every pending commission past its hold whose re-screen is clear.
    ///
    /// Re-screen `Flagged` holds the commission for review; `Blocked` cancels it.
    /// Re-running is harmless: only still-pending, unflagged commissions move.
    #[tracing::instrument(name = "ledger.validate_matured", skip_all)]
    pub async fn validate_matured(&self, now: DateTime<Utc>) -> Result<ValidationReport, LedgerError> {
        let hold = Duration::days(i64::from(self.config.hold_days));
        let window = Duration::seconds(self.fraud.config().velocity_window_secs as i64);
        let mut total = ValidationReport::default();

        for root in self.repo.store().list_roots(AffiliateState::DOMAIN).await? {
            let loaded = self.repo.load::<AffiliateState>(root).await?;
            let Some(account) = &loaded.state.account else {
                continue;
            };
            let affiliate_id = account.affiliate_id.clone();

            let mut verdicts = Vec::new();
            for commission in loaded.state.commissions.iter().filter(|c| {
                c.status == CommissionStatus::Pending && c.flag.is_none() && c.created_at + hold <= now
            }) {
                let mut ctx = ScreenContext::new(affiliate_id.clone(), commission.kind, commission.created_at);
                ctx.actor_id = commission.actor_id.clone();
                ctx.recruit_id = commission.recruit_id.clone();
                ctx.recent_credits = loaded
                    .state
                    .credits_between(commission.created_at - window, commission.created_at)
                    .saturating_sub(1);
                verdicts.push((commission.id, self.fraud.screen(&ctx).await?));
            }
            if verdicts.is_empty() {
                continue;
            }

            let mut report = self
                .repo
                .execute::<AffiliateState, _, LedgerError, _>(root, |loaded| {
                    let mut report = ValidationReport::default();
                    let mut events = Vec::new();
                    for (commission_id, verdict) in &verdicts {
                        let Some(c) = loaded.state.commission(*commission_id) else {
                            continue;
                        };
                        if c.status != CommissionStatus::Pending || c.flag.is_some() {
                            continue;
                        }
                        let commission_id = *commission_id;
                        events.push(NewEvent::new(match verdict {
                            Verdict::Clear => {
                                report.validated += 1;
                                LedgerEvent::CommissionValidated { commission_id, at: now }
                            }
                            Verdict::Flagged(reason) => {
                                report.flagged += 1;
                                LedgerEvent::CommissionFlagged {
                                    commission_id,
                                    reason: reason.clone(),
                                    at: now,
                                }
                            }
                            Verdict::Blocked(reason) => {
                                report.cancelled += 1;
                                LedgerEvent::CommissionCancelled {
                                    commission_id,
                                    reason: format!("fraud: {reason}"),
                                    at: now,
                                }
                            }
                        }));
                    }
                    Ok(if events.is_empty() {
                        Decision::Done(report)
                    } else {
                        Decision::Append(events, report)
                    })
                })
                .await?;

            if report.validated > 0 {
                info!(%affiliate_id, validated = report.validated, "Commissions validated");
                report.bonuses = self.check_recruitment_bonus(&affiliate_id, now).await?.len();
            }
            total += report;
        }
        Ok(total)
    }

    /// Monthly payout cycle: every validated, unflagged commission becomes payable.
    #[tracing::instrument(name = "ledger.release_payable", skip_all)]
    pub async fn release_payable(&self, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        let mut released = 0;
        for root in self.repo.store().list_roots(AffiliateState::DOMAIN).await? {
            released += self
                .repo
                .execute::<AffiliateState, _, LedgerError, _>(root, |loaded| {
                    let events: Vec<NewEvent> = loaded
                        .state
                        .commissions
                        .iter()
                        .filter(|c| c.status == CommissionStatus::Validated && c.flag.is_none())
                        .map(|c| {
                            NewEvent::new(LedgerEvent::CommissionPayable {
                                commission_id: c.id,
                                at: now,
                            })
                        })
                        .collect();
                    let count = events.len();
                    Ok(if count == 0 {
                        Decision::Done(0)
                    } else {
                        Decision::Append(events, count)
                    })
                })
                .await?;
        }
        if released > 0 {
            info!(released, "Validated commissions released to payable");
        }
        Ok(released)
    }

    /// Events marking the payable commissions that cover `withdrawal` as paid.
    pub fn payout_events(
        state: &AffiliateState,
        withdrawal: &WithdrawalRequest,
        payout_ref: &str,
        at: DateTime<Utc>,
    ) -> Vec<NewEvent> {
        state
            .payable_covering(withdrawal.amount)
            .into_iter()
            .map(|commission_id| {
                NewEvent::new(LedgerEvent::CommissionPaid {
                    commission_id,
                    withdrawal_id: Some(withdrawal.id),
                    payout_ref: Some(payout_ref.to_string()),
                    at,
                })
            })
            .collect()
    }

    // ---- Refunds ----

    /// Reverse every commission derived from a refunded external event.
    ///
    /// Unpaid commissions are cancelled. Paid ones are clawed back when the
    /// refund falls within the clawback window of `paid_at` (boundary
    /// inclusive); later refunds leave the ledger untouched.
    #[tracing::instrument(
        name = "ledger.apply_refund",
        skip_all,
        fields(%refund_id, %original_source_event_id)
    )]
    pub async fn apply_refund(
        &self,
        refund_id: &str,
        original_source_event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<RefundEffect>, LedgerError> {
        let clawback_months = Months::new(self.config.clawback_window_months);
        let affiliates = self
            .repo
            .index()
            .lookup_all(IndexKind::OriginEvent, original_source_event_id)
            .await?;

        let mut effects = Vec::new();
        for affiliate in affiliates {
            let affiliate_id = AffiliateId::new(affiliate);
            let mut affiliate_effects = self
                .repo
                .execute::<AffiliateState, _, LedgerError, _>(affiliate_id.root(), |loaded| {
                    let mut events = Vec::new();
                    let mut effects = Vec::new();
                    for c in loaded
                        .state
                        .commissions
                        .iter()
                        .filter(|c| c.origin_event_id == original_source_event_id)
                    {
                        let outcome = match c.status {
                            CommissionStatus::Pending
                            | CommissionStatus::Validated
                            | CommissionStatus::Payable => {
                                events.push(NewEvent::new(LedgerEvent::CommissionCancelled {
                                    commission_id: c.id,
                                    reason: format!("refund {refund_id}"),
                                    at,
                                }));
                                RefundOutcome::Cancelled
                            }
                            CommissionStatus::Paid => {
                                let paid_at = c.paid_at.unwrap_or(c.created_at);
                                let deadline = paid_at
                                    .checked_add_months(clawback_months)
                                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                                if at <= deadline {
                                    events.push(NewEvent::new(LedgerEvent::CommissionClawedBack {
                                        commission_id: c.id,
                                        refund_id: refund_id.to_string(),
                                        at,
                                    }));
                                    RefundOutcome::ClawedBack
                                } else {
                                    RefundOutcome::ClawbackWindowExpired
                                }
                            }
                            CommissionStatus::Cancelled | CommissionStatus::ClawedBack => {
                                RefundOutcome::AlreadyReversed
                            }
                        };
                        effects.push(RefundEffect {
                            affiliate_id: affiliate_id.clone(),
                            commission_id: c.id,
                            outcome,
                        });
                    }
                    Ok(if events.is_empty() {
                        Decision::Done(effects)
                    } else {
                        Decision::Append(events, effects)
                    })
                })
                .await?;
            effects.append(&mut affiliate_effects);
        }

        for effect in &effects {
            match effect.outcome {
                RefundOutcome::ClawbackWindowExpired => info!(
                    affiliate_id = %effect.affiliate_id,
                    commission_id = %effect.commission_id,
                    "Refund arrived after clawback window; no ledger effect"
                ),
                RefundOutcome::Cancelled | RefundOutcome::ClawedBack => info!(
                    affiliate_id = %effect.affiliate_id,
                    commission_id = %effect.commission_id,
                    outcome = ?effect.outcome,
                    "Commission reversed by refund"
                ),
                RefundOutcome::AlreadyReversed => {}
            }
        }
        Ok(effects)
    }

    // ---- Manual review ----

    /// Clear a fraud flag so the commission can validate.
    pub async fn clear_flag(
        &self,
        affiliate_id: &AffiliateId,
        commission_id: CommissionId,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.review(affiliate_id, commission_id, "clear flag", |_| {
            LedgerEvent::CommissionFlagCleared {
                commission_id,
                reviewer: reviewer.to_string(),
                at,
            }
        })
        .await?;
        info!(%affiliate_id, %commission_id, reviewer, "Fraud flag cleared");
        Ok(())
    }

    /// Cancel a flagged commission after review.
    pub async fn reject_flagged(
        &self,
        affiliate_id: &AffiliateId,
        commission_id: CommissionId,
        reviewer: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.review(affiliate_id, commission_id, "reject", |_| {
            LedgerEvent::CommissionCancelled {
                commission_id,
                reason: format!("rejected by {reviewer}: {reason}"),
                at,
            }
        })
        .await?;
        warn!(%affiliate_id, %commission_id, reviewer, reason, "Flagged commission rejected");
        Ok(())
    }

    async fn review<F>(
        &self,
        affiliate_id: &AffiliateId,
        commission_id: CommissionId,
        action: &'static str,
        make_event: F,
    ) -> Result<(), LedgerError>
    where
        F: Fn(&CommissionEvent) -> LedgerEvent,
    {
        self.repo
            .execute::<AffiliateState, _, LedgerError, _>(affiliate_id.root(), |loaded| {
                let c = loaded
                    .state
                    .commission(commission_id)
                    .ok_or(LedgerError::UnknownCommission(commission_id))?;
                if c.status != CommissionStatus::Pending || c.flag.is_none() {
                    return Err(LedgerError::InvalidTransition {
                        commission_id,
                        status: c.status,
                        action,
                    });
                }
                Ok(Decision::Append(vec![NewEvent::new(make_event(c))], ()))
            })
            .await
    }

    // ---- Queries ----

    pub async fn balance_of(&self, affiliate_id: &AffiliateId) -> Result<Balance, LedgerError> {
        let state = self.state(affiliate_id).await?;
        if state.account.is_none() {
            return Err(LedgerError::UnknownAffiliate(affiliate_id.clone()));
        }
        Ok(state.balance())
    }

    /// Commissions of one affiliate, oldest first.
    pub async fn commissions_of(
        &self,
        affiliate_id: &AffiliateId,
    ) -> Result<Vec<CommissionEvent>, LedgerError> {
        Ok(self.state(affiliate_id).await?.commissions)
    }

    pub async fn find_commission(
        &self,
        commission_id: CommissionId,
    ) -> Result<Option<CommissionEvent>, LedgerError> {
        let Some(affiliate) = self
            .repo
            .index()
            .lookup(IndexKind::Commission, &commission_id.to_string())
            .await?
        else {
            return Ok(None);
        };
        let state = self.state(&AffiliateId::new(affiliate)).await?;
        Ok(state.commission(commission_id).cloned())
    }
}
