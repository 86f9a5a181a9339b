//! Withdrawal workflow.
//!
//! `requested -> (pending_confirmation ->)? confirmed/approved -> processing -> completed`,
//! with `rejected`, `failed`, `cancelled`, and `expired` as alternative terminals.
//!
//! The reservation is the `WithdrawalRequested` event itself: it lands in the
//! affiliate stream in the same optimistic append that checks the balance and
//! the one-active-withdrawal rule, so two concurrent requests can never both
//! reserve the same money. Waiting on the human is persisted state plus a
//! deadline; [`WithdrawalWorkflow::expire_stale`] releases abandoned requests.

use std::sync::Arc;

use backon::BackoffBuilder;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{SettlementPolicy, WithdrawalConfig};
use crate::events::LedgerEvent;
use crate::interfaces::event_store::{NewEvent, StorageError};
use crate::interfaces::external::{ClientError, ConfirmationChannel, KycVerifier, PayoutRail};
use crate::ledger::{AffiliateState, CommissionLedger, LedgerError};
use crate::model::{
    AccountStatus, AffiliateId, Cents, KycStatus, PaymentMethod, WithdrawalId, WithdrawalRequest,
    WithdrawalStatus,
};
use crate::repository::{Decision, IndexKind, Repository};
use crate::utils::retry::rail_backoff;

#[derive(Debug, thiserror::Error)]
pub enum WithdrawalError {
    #[error("Withdrawals are disabled")]
    WithdrawalsDisabled,

    #[error("Unknown affiliate: {0}")]
    UnknownAffiliate(AffiliateId),

    #[error("Affiliate {affiliate_id} is {status:?}")]
    AccountInactive {
        affiliate_id: AffiliateId,
        status: AccountStatus,
    },

    #[error("Withdrawal amount must be positive, got {0}")]
    InvalidAmount(Cents),

    #[error("Amount {amount} is below the minimum withdrawal of {minimum}")]
    BelowWithdrawalThreshold { amount: Cents, minimum: Cents },

    #[error("Requested {requested} but only {available} is available")]
    InsufficientBalance { requested: Cents, available: Cents },

    #[error("Withdrawal {0} is already in progress")]
    PendingWithdrawalExists(WithdrawalId),

    #[error("Identity verification required")]
    KycRequired,

    #[error("A linked Telegram account is required to confirm withdrawals")]
    TelegramRequired,

    #[error("Confirmation channel unavailable: {0}")]
    ConfirmationChannelUnavailable(String),

    #[error("Confirmation reference does not match withdrawal {0}")]
    ConfirmationMismatch(WithdrawalId),

    #[error("Confirmation window for withdrawal {0} has passed")]
    ConfirmationExpired(WithdrawalId),

    #[error("Unknown withdrawal: {0}")]
    UnknownWithdrawal(WithdrawalId),

    #[error("Unknown confirmation reference: {0}")]
    UnknownConfirmationRef(String),

    #[error("Withdrawal {withdrawal_id} is {status:?}; cannot {action}")]
    InvalidTransition {
        withdrawal_id: WithdrawalId,
        status: WithdrawalStatus,
        action: &'static str,
    },

    #[error("Payout rail failed for withdrawal {withdrawal_id}: {reason}")]
    ExternalRailFailure {
        withdrawal_id: WithdrawalId,
        reason: String,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn closed(
    withdrawal_id: WithdrawalId,
    status: WithdrawalStatus,
    reason: Option<String>,
    at: DateTime<Utc>,
) -> NewEvent {
    NewEvent::new(LedgerEvent::WithdrawalClosed {
        withdrawal_id,
        status,
        reason,
        at,
    })
}

fn find(
    state: &AffiliateState,
    withdrawal_id: WithdrawalId,
) -> Result<&WithdrawalRequest, WithdrawalError> {
    state
        .withdrawal(withdrawal_id)
        .ok_or(WithdrawalError::UnknownWithdrawal(withdrawal_id))
}

pub struct WithdrawalWorkflow {
    repo: Repository,
    ledger: Arc<CommissionLedger>,
    confirmation: Arc<dyn ConfirmationChannel>,
    rail: Arc<dyn PayoutRail>,
    kyc: Arc<dyn KycVerifier>,
    config: WithdrawalConfig,
}

impl WithdrawalWorkflow {
    pub fn new(
        repo: Repository,
        ledger: Arc<CommissionLedger>,
        confirmation: Arc<dyn ConfirmationChannel>,
        rail: Arc<dyn PayoutRail>,
        kyc: Arc<dyn KycVerifier>,
        config: WithdrawalConfig,
    ) -> Self {
        Self {
            repo,
            ledger,
            confirmation,
            rail,
            kyc,
            config,
        }
    }

    /// Affiliate owning a withdrawal.
    async fn owner(&self, withdrawal_id: WithdrawalId) -> Result<AffiliateId, WithdrawalError> {
        self.repo
            .index()
            .lookup(IndexKind::Withdrawal, &withdrawal_id.to_string())
            .await?
            .map(AffiliateId::new)
            .ok_or(WithdrawalError::UnknownWithdrawal(withdrawal_id))
    }

    /// Run a transition on the withdrawal's affiliate stream.
    async fn transition<T, F>(
        &self,
        withdrawal_id: WithdrawalId,
        mut decide: F,
    ) -> Result<T, WithdrawalError>
    where
        F: FnMut(&AffiliateState) -> Result<Decision<T>, WithdrawalError>,
    {
        let affiliate_id = self.owner(withdrawal_id).await?;
        self.repo
            .execute::<AffiliateState, _, WithdrawalError, _>(affiliate_id.root(), |loaded| {
                decide(&loaded.state)
            })
            .await
    }

    pub async fn withdrawal(
        &self,
        withdrawal_id: WithdrawalId,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        let affiliate_id = self.owner(withdrawal_id).await?;
        let state = self.ledger.state(&affiliate_id).await?;
        Ok(find(&state, withdrawal_id)?.clone())
    }

    /// Withdrawals of one affiliate, oldest first.
    pub async fn withdrawals_of(
        &self,
        affiliate_id: &AffiliateId,
    ) -> Result<Vec<WithdrawalRequest>, WithdrawalError> {
        Ok(self.ledger.state(affiliate_id).await?.withdrawals)
    }

    /// Resolve KYC, caching a positive answer on the account.
    async fn ensure_kyc(
        &self,
        affiliate_id: &AffiliateId,
        kyc: KycStatus,
        at: DateTime<Utc>,
    ) -> Result<(), WithdrawalError> {
        if kyc == KycStatus::Verified {
            return Ok(());
        }
        if !self.kyc.is_verified(affiliate_id).await? {
            return Err(WithdrawalError::KycRequired);
        }
        self.ledger.record_kyc_verified(affiliate_id, at).await?;
        Ok(())
    }

    /// Request a withdrawal and reserve its amount.
    ///
    /// When the program requires confirmation the request moves to
    /// `pending_confirmation` and the affiliate is prompted on the linked
    /// channel; otherwise it is approved (or left for an operator when the
    /// program requires manual approval).
    #[tracing::instrument(
        name = "withdrawal.request",
        skip_all,
        fields(%affiliate_id, amount)
    )]
    pub async fn request(
        &self,
        affiliate_id: &AffiliateId,
        amount: Cents,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        self.create(affiliate_id, amount, method, now, false).await
    }

    async fn create(
        &self,
        affiliate_id: &AffiliateId,
        amount: Cents,
        method: PaymentMethod,
        now: DateTime<Utc>,
        automatic: bool,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        if !self.config.enabled {
            return Err(WithdrawalError::WithdrawalsDisabled);
        }
        if amount <= 0 {
            return Err(WithdrawalError::InvalidAmount(amount));
        }

        let state = self.ledger.state(affiliate_id).await?;
        let account = state
            .account
            .as_ref()
            .ok_or_else(|| WithdrawalError::UnknownAffiliate(affiliate_id.clone()))?;
        if account.status != AccountStatus::Active {
            return Err(WithdrawalError::AccountInactive {
                affiliate_id: affiliate_id.clone(),
                status: account.status,
            });
        }
        let program = self.ledger.programs().for_program(account.program).clone();
        if amount < program.min_withdrawal {
            return Err(WithdrawalError::BelowWithdrawalThreshold {
                amount,
                minimum: program.min_withdrawal,
            });
        }
        if let Some(active) = state.active_withdrawal() {
            return Err(WithdrawalError::PendingWithdrawalExists(active.id));
        }
        let available = state.balance().available;
        if amount > available {
            return Err(WithdrawalError::InsufficientBalance {
                requested: amount,
                available,
            });
        }

        self.ensure_kyc(affiliate_id, account.kyc, now).await?;

        let needs_confirmation = program.confirmation_required && !automatic;
        let handle = match (&account.confirmation_handle, needs_confirmation) {
            (Some(handle), true) => Some(handle.clone()),
            (None, true) => return Err(WithdrawalError::TelegramRequired),
            (_, false) => None,
        };
        let auto_approve = automatic || (!needs_confirmation && !program.manual_approval);

        let withdrawal_id = Uuid::new_v4();
        self.repo
            .index()
            .link(
                IndexKind::Withdrawal,
                &withdrawal_id.to_string(),
                affiliate_id.as_str(),
            )
            .await?;

        let withdrawal = self
            .repo
            .execute::<AffiliateState, _, WithdrawalError, _>(affiliate_id.root(), |loaded| {
                let state = &loaded.state;
                if let Some(active) = state.active_withdrawal() {
                    return Err(WithdrawalError::PendingWithdrawalExists(active.id));
                }
                let available = state.balance().available;
                if amount > available {
                    return Err(WithdrawalError::InsufficientBalance {
                        requested: amount,
                        available,
                    });
                }

                let mut events = vec![NewEvent::new(LedgerEvent::WithdrawalRequested {
                    withdrawal_id,
                    amount,
                    method,
                    at: now,
                })];
                if auto_approve {
                    events.push(NewEvent::new(LedgerEvent::WithdrawalApproved {
                        withdrawal_id,
                        approved_by: None,
                        at: now,
                    }));
                }
                let withdrawal = WithdrawalRequest {
                    id: withdrawal_id,
                    affiliate_id: affiliate_id.clone(),
                    amount,
                    method,
                    status: if auto_approve {
                        WithdrawalStatus::Approved
                    } else {
                        WithdrawalStatus::Requested
                    },
                    confirmation_ref: None,
                    confirmation_deadline: None,
                    payout_ref: None,
                    reason: None,
                    covered_commissions: Vec::new(),
                    created_at: now,
                    processed_at: None,
                };
                Ok(Decision::Append(events, withdrawal))
            })
            .await?;

        info!(%withdrawal_id, status = withdrawal.status.as_str(), "Withdrawal reserved");

        let Some(handle) = handle else {
            return Ok(withdrawal);
        };
        self.await_confirmation(withdrawal, &handle, now).await
    }

    async fn await_confirmation(
        &self,
        withdrawal: WithdrawalRequest,
        handle: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        let withdrawal_id = withdrawal.id;
        let root = withdrawal.affiliate_id.root();

        let confirmation_ref = match self
            .confirmation
            .request_confirmation(withdrawal_id, &withdrawal.affiliate_id, handle, withdrawal.amount)
            .await
        {
            Ok(reference) => reference,
            Err(e) => {
                warn!(%withdrawal_id, error = %e, "Confirmation channel failed, releasing reservation");
                let reason = format!("confirmation channel unavailable: {e}");
                self.repo
                    .execute::<AffiliateState, _, WithdrawalError, _>(root, |loaded| {
                        let w = find(&loaded.state, withdrawal_id)?;
                        if !w.status.is_active() {
                            return Ok(Decision::Done(()));
                        }
                        Ok(Decision::Append(
                            vec![closed(
                                withdrawal_id,
                                WithdrawalStatus::Cancelled,
                                Some(reason.clone()),
                                now,
                            )],
                            (),
                        ))
                    })
                    .await?;
                return Err(WithdrawalError::ConfirmationChannelUnavailable(e.to_string()));
            }
        };

        self.repo
            .index()
            .link(IndexKind::ConfirmationRef, &confirmation_ref, &withdrawal_id.to_string())
            .await?;

        let deadline = now + Duration::seconds(self.config.confirmation_timeout_secs as i64);
        let withdrawal = self
            .repo
            .execute::<AffiliateState, _, WithdrawalError, _>(root, |loaded| {
                let w = find(&loaded.state, withdrawal_id)?;
                if w.status != WithdrawalStatus::Requested {
                    return Err(WithdrawalError::InvalidTransition {
                        withdrawal_id,
                        status: w.status,
                        action: "await confirmation",
                    });
                }
                let mut updated = w.clone();
                updated.status = WithdrawalStatus::PendingConfirmation;
                updated.confirmation_ref = Some(confirmation_ref.clone());
                updated.confirmation_deadline = Some(deadline);
                Ok(Decision::Append(
                    vec![NewEvent::new(LedgerEvent::WithdrawalAwaitingConfirmation {
                        withdrawal_id,
                        confirmation_ref: confirmation_ref.clone(),
                        deadline,
                        at: now,
                    })],
                    updated,
                ))
            })
            .await?;

        info!(%withdrawal_id, %deadline, "Withdrawal awaiting confirmation");
        Ok(withdrawal)
    }

    /// The affiliate confirmed on the channel.
    ///
    /// A confirmation after the deadline expires the request instead.
    pub async fn confirm(
        &self,
        withdrawal_id: WithdrawalId,
        confirmation_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        let manual_approval = {
            let affiliate_id = self.owner(withdrawal_id).await?;
            let state = self.ledger.state(&affiliate_id).await?;
            state
                .account
                .as_ref()
                .map(|a| self.ledger.programs().for_program(a.program).manual_approval)
                .unwrap_or(false)
        };

        let (status, expired) = self
            .transition(withdrawal_id, |state| {
                let w = find(state, withdrawal_id)?;
                if w.confirmation_ref.as_deref() != Some(confirmation_ref) {
                    return Err(WithdrawalError::ConfirmationMismatch(withdrawal_id));
                }
                match w.status {
                    WithdrawalStatus::PendingConfirmation => {}
                    WithdrawalStatus::Confirmed
                    | WithdrawalStatus::Approved
                    | WithdrawalStatus::Processing
                    | WithdrawalStatus::Completed => return Ok(Decision::Done((w.status, false))),
                    status => {
                        return Err(WithdrawalError::InvalidTransition {
                            withdrawal_id,
                            status,
                            action: "confirm",
                        })
                    }
                }
                if w.confirmation_deadline.is_some_and(|deadline| now > deadline) {
                    return Ok(Decision::Append(
                        vec![closed(
                            withdrawal_id,
                            WithdrawalStatus::Expired,
                            Some("confirmation arrived after deadline".to_string()),
                            now,
                        )],
                        (WithdrawalStatus::Expired, true),
                    ));
                }

                let mut events = vec![NewEvent::new(LedgerEvent::WithdrawalConfirmed {
                    withdrawal_id,
                    at: now,
                })];
                let status = if manual_approval {
                    WithdrawalStatus::Confirmed
                } else {
                    events.push(NewEvent::new(LedgerEvent::WithdrawalApproved {
                        withdrawal_id,
                        approved_by: None,
                        at: now,
                    }));
                    WithdrawalStatus::Approved
                };
                Ok(Decision::Append(events, (status, false)))
            })
            .await?;

        if expired {
            info!(%withdrawal_id, "Late confirmation; withdrawal expired");
            return Err(WithdrawalError::ConfirmationExpired(withdrawal_id));
        }
        info!(%withdrawal_id, status = status.as_str(), "Withdrawal confirmed");
        self.withdrawal(withdrawal_id).await
    }

    async fn by_ref(&self, confirmation_ref: &str) -> Result<WithdrawalId, WithdrawalError> {
        let value = self
            .repo
            .index()
            .lookup(IndexKind::ConfirmationRef, confirmation_ref)
            .await?
            .ok_or_else(|| WithdrawalError::UnknownConfirmationRef(confirmation_ref.to_string()))?;
        Uuid::parse_str(&value).map_err(|e| StorageError::InvalidUuid(e).into())
    }

    /// Inbound `confirmed(ref)` callback from the channel.
    pub async fn confirmed_by_ref(
        &self,
        confirmation_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        let withdrawal_id = self.by_ref(confirmation_ref).await?;
        self.confirm(withdrawal_id, confirmation_ref, now).await
    }

    /// Inbound `cancelled(ref)` callback from the channel.
    pub async fn cancelled_by_ref(
        &self,
        confirmation_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        let withdrawal_id = self.by_ref(confirmation_ref).await?;
        self.cancel(withdrawal_id, "cancelled by affiliate", now).await
    }

    /// Close a withdrawal before processing, releasing the reservation.
    async fn close(
        &self,
        withdrawal_id: WithdrawalId,
        status: WithdrawalStatus,
        action: &'static str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        self.transition(withdrawal_id, |state| {
            let w = find(state, withdrawal_id)?;
            if w.status == status {
                return Ok(Decision::Done(()));
            }
            if !w.status.is_pre_processing() {
                return Err(WithdrawalError::InvalidTransition {
                    withdrawal_id,
                    status: w.status,
                    action,
                });
            }
            Ok(Decision::Append(
                vec![closed(withdrawal_id, status, Some(reason.to_string()), now)],
                (),
            ))
        })
        .await?;
        info!(%withdrawal_id, status = status.as_str(), reason, "Withdrawal closed, reservation released");
        self.withdrawal(withdrawal_id).await
    }

    pub async fn cancel(
        &self,
        withdrawal_id: WithdrawalId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        self.close(withdrawal_id, WithdrawalStatus::Cancelled, "cancel", reason, now)
            .await
    }

    /// Operator rejection.
    pub async fn reject(
        &self,
        withdrawal_id: WithdrawalId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        self.close(withdrawal_id, WithdrawalStatus::Rejected, "reject", reason, now)
            .await
    }

    /// Expire one withdrawal whose confirmation deadline has passed.
    /// Returns false when it was not awaiting confirmation or is not yet due.
    pub async fn expire(
        &self,
        withdrawal_id: WithdrawalId,
        now: DateTime<Utc>,
    ) -> Result<bool, WithdrawalError> {
        let expired = self
            .transition(withdrawal_id, |state| {
                let w = find(state, withdrawal_id)?;
                let due = w.status == WithdrawalStatus::PendingConfirmation
                    && w.confirmation_deadline.is_some_and(|deadline| deadline <= now);
                if !due {
                    return Ok(Decision::Done(false));
                }
                Ok(Decision::Append(
                    vec![closed(
                        withdrawal_id,
                        WithdrawalStatus::Expired,
                        Some("confirmation timed out".to_string()),
                        now,
                    )],
                    true,
                ))
            })
            .await?;
        if expired {
            info!(%withdrawal_id, "Withdrawal expired, reservation released");
        }
        Ok(expired)
    }

    /// Expire every withdrawal whose confirmation deadline has passed.
    #[tracing::instrument(name = "withdrawal.expire_stale", skip_all)]
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize, WithdrawalError> {
        let mut count = 0;
        for state in self.ledger.affiliates().await? {
            let due = state.withdrawals.iter().filter(|w| {
                w.status == WithdrawalStatus::PendingConfirmation
                    && w.confirmation_deadline.is_some_and(|deadline| deadline <= now)
            });
            for withdrawal in due {
                if self.expire(withdrawal.id, now).await? {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Operator approval for programs with manual approval.
    pub async fn approve(
        &self,
        withdrawal_id: WithdrawalId,
        approver: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        self.transition(withdrawal_id, |state| {
            let w = find(state, withdrawal_id)?;
            match w.status {
                WithdrawalStatus::Approved => Ok(Decision::Done(())),
                WithdrawalStatus::Confirmed => Ok(Decision::Append(
                    vec![NewEvent::new(LedgerEvent::WithdrawalApproved {
                        withdrawal_id,
                        approved_by: Some(approver.to_string()),
                        at: now,
                    })],
                    (),
                )),
                // Requested without a confirmation step
                WithdrawalStatus::Requested if w.confirmation_ref.is_none() => {
                    Ok(Decision::Append(
                        vec![NewEvent::new(LedgerEvent::WithdrawalApproved {
                            withdrawal_id,
                            approved_by: Some(approver.to_string()),
                            at: now,
                        })],
                        (),
                    ))
                }
                status => Err(WithdrawalError::InvalidTransition {
                    withdrawal_id,
                    status,
                    action: "approve",
                }),
            }
        })
        .await?;
        info!(%withdrawal_id, approver, "Withdrawal approved");
        self.withdrawal(withdrawal_id).await
    }

    /// Disburse an approved withdrawal through the payout rail.
    ///
    /// Transient rail failures retry with exponential backoff. Exhausted or
    /// permanent failures move the withdrawal to `failed`, releasing the
    /// reservation; covered commissions stay `payable`.
    #[tracing::instrument(name = "withdrawal.process", skip_all, fields(%withdrawal_id))]
    pub async fn process(
        &self,
        withdrawal_id: WithdrawalId,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        let current = self.withdrawal(withdrawal_id).await?;
        let details = self
            .ledger
            .account(&current.affiliate_id)
            .await?
            .and_then(|a| a.payment_details);

        // Fallible reads go before the claim: once `processing` is recorded
        // only settlement or the `failed` branch release the reservation.
        let claimed = self
            .transition(withdrawal_id, |state| {
                let w = find(state, withdrawal_id)?;
                if w.status != WithdrawalStatus::Approved {
                    return Err(WithdrawalError::InvalidTransition {
                        withdrawal_id,
                        status: w.status,
                        action: "process",
                    });
                }
                let mut claimed = w.clone();
                claimed.status = WithdrawalStatus::Processing;
                Ok(Decision::Append(
                    vec![NewEvent::new(LedgerEvent::WithdrawalProcessing {
                        withdrawal_id,
                        at: now,
                    })],
                    claimed,
                ))
            })
            .await?;

        let mut delays = rail_backoff(&self.config).build();
        let mut attempt = 1u32;
        let receipt = loop {
            match self
                .rail
                .disburse(
                    withdrawal_id,
                    &claimed.affiliate_id,
                    claimed.amount,
                    claimed.method,
                    details.as_ref(),
                )
                .await
            {
                Ok(receipt) => break Ok(receipt),
                Err(e) if e.is_transient() => match delays.next() {
                    Some(delay) => {
                        warn!(attempt, error = %e, "Payout rail failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => break Err(e),
                },
                Err(e) => break Err(e),
            }
        };

        match receipt {
            Ok(receipt) if receipt.settled => self.settle(withdrawal_id, &receipt.payout_ref, now).await,
            Ok(receipt) => {
                info!(payout_ref = %receipt.payout_ref, "Payout submitted, awaiting settlement");
                Ok(claimed)
            }
            Err(e) => {
                error!(attempt, error = %e, "Payout rail failed, withdrawal failed");
                let reason = e.to_string();
                self.transition(withdrawal_id, |state| {
                    let w = find(state, withdrawal_id)?;
                    if w.status != WithdrawalStatus::Processing {
                        return Ok(Decision::Done(()));
                    }
                    Ok(Decision::Append(
                        vec![closed(
                            withdrawal_id,
                            WithdrawalStatus::Failed,
                            Some(reason.clone()),
                            now,
                        )],
                        (),
                    ))
                })
                .await?;
                Err(WithdrawalError::ExternalRailFailure {
                    withdrawal_id,
                    reason,
                })
            }
        }
    }

    /// Record the rail's settlement: the withdrawal completes and the payable
    /// commissions covering it become `paid`.
    pub async fn settle(
        &self,
        withdrawal_id: WithdrawalId,
        payout_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        let covered = self
            .transition(withdrawal_id, |state| {
                let w = find(state, withdrawal_id)?;
                match w.status {
                    WithdrawalStatus::Processing => {}
                    WithdrawalStatus::Completed if w.payout_ref.as_deref() == Some(payout_ref) => {
                        return Ok(Decision::Done(0));
                    }
                    status => {
                        return Err(WithdrawalError::InvalidTransition {
                            withdrawal_id,
                            status,
                            action: "settle",
                        })
                    }
                }
                let mut events = CommissionLedger::payout_events(state, w, payout_ref, now);
                let covered = events.len();
                events.push(NewEvent::new(LedgerEvent::WithdrawalCompleted {
                    withdrawal_id,
                    payout_ref: payout_ref.to_string(),
                    at: now,
                }));
                Ok(Decision::Append(events, covered))
            })
            .await?;

        info!(%withdrawal_id, payout_ref, covered, "Withdrawal completed");
        self.withdrawal(withdrawal_id).await
    }

    /// Automatic settlement: withdraw each eligible affiliate's full available
    /// balance and disburse it. No-op under the on-request policy.
    #[tracing::instrument(name = "withdrawal.run_automatic_payouts", skip_all)]
    pub async fn run_automatic_payouts(&self, now: DateTime<Utc>) -> Result<usize, WithdrawalError> {
        if self.ledger.config().settlement_policy != SettlementPolicy::Automatic || !self.config.enabled {
            return Ok(0);
        }

        let mut paid = 0;
        for state in self.ledger.affiliates().await? {
            let Some(account) = &state.account else {
                continue;
            };
            let Some(method) = account.payment_details.as_ref().map(|d| d.method()) else {
                debug!(affiliate_id = %account.affiliate_id, "No payment details; skipping payout");
                continue;
            };
            let available = state.balance().available;
            let minimum = self.ledger.programs().for_program(account.program).min_withdrawal;
            if account.status != AccountStatus::Active
                || state.active_withdrawal().is_some()
                || available < minimum
            {
                continue;
            }

            let withdrawal = match self
                .create(&account.affiliate_id, available, method, now, true)
                .await
            {
                Ok(withdrawal) => withdrawal,
                Err(
                    e @ (WithdrawalError::KycRequired
                    | WithdrawalError::PendingWithdrawalExists(_)
                    | WithdrawalError::InsufficientBalance { .. }),
                ) => {
                    debug!(affiliate_id = %account.affiliate_id, error = %e, "Automatic payout skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.process(withdrawal.id, now).await {
                Ok(_) => paid += 1,
                Err(WithdrawalError::ExternalRailFailure { withdrawal_id, reason }) => {
                    warn!(%withdrawal_id, %reason, "Automatic payout failed");
                }
                Err(e) => return Err(e),
            }
        }
        if paid > 0 {
            info!(paid, "Automatic payouts disbursed");
        }
        Ok(paid)
    }
}

#[cfg(test)]
mod tests;
