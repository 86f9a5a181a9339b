//! Affiliate stream state.
//!
//! The affiliate stream owns the account, every commission credited to it, and
//! every withdrawal it requested. Keeping them in one stream makes the balance
//! check and the withdrawal reservation a single optimistic append.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::events::LedgerEvent;
use crate::interfaces::event_store::EventPage;
use crate::model::{
    AccountStatus, AffiliateId, CommissionEvent, CommissionId, CommissionStatus, KycStatus,
    PaymentDetails, ProgramType, WithdrawalId, WithdrawalRequest, WithdrawalStatus,
};
use crate::repository::Aggregate;

use super::balance::Balance;

/// Partner account profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AffiliateAccount {
    pub affiliate_id: AffiliateId,
    pub program: ProgramType,
    pub client_code: String,
    pub recruitment_code: String,
    pub registered_at: DateTime<Utc>,
    pub status: AccountStatus,
    pub kyc: KycStatus,
    /// Linked confirmation handle (Telegram chat).
    pub confirmation_handle: Option<String>,
    pub payment_details: Option<PaymentDetails>,
}

#[derive(Debug, Clone, Default)]
pub struct AffiliateState {
    pub account: Option<AffiliateAccount>,
    pub commissions: Vec<CommissionEvent>,
    pub withdrawals: Vec<WithdrawalRequest>,
    commission_index: HashMap<CommissionId, usize>,
    source_index: HashMap<String, usize>,
    withdrawal_index: HashMap<WithdrawalId, usize>,
}

impl AffiliateState {
    pub fn commission(&self, id: CommissionId) -> Option<&CommissionEvent> {
        self.commission_index.get(&id).map(|&i| &self.commissions[i])
    }

    pub fn commission_by_source(&self, source_event_id: &str) -> Option<&CommissionEvent> {
        self.source_index
            .get(source_event_id)
            .map(|&i| &self.commissions[i])
    }

    pub fn withdrawal(&self, id: WithdrawalId) -> Option<&WithdrawalRequest> {
        self.withdrawal_index.get(&id).map(|&i| &self.withdrawals[i])
    }

    /// The one non-terminal withdrawal, if any.
    pub fn active_withdrawal(&self) -> Option<&WithdrawalRequest> {
        self.withdrawals.iter().find(|w| w.status.is_active())
    }

    pub fn balance(&self) -> Balance {
        Balance::compute(&self.commissions, &self.withdrawals)
    }

    /// Sum of validated, payable, and paid commissions.
    pub fn earned(&self) -> i64 {
        self.commissions
            .iter()
            .filter(|c| c.status.counts_as_earned())
            .map(|c| c.amount)
            .sum()
    }

    /// Credits created in `[from, to]`.
    pub fn credits_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        self.commissions
            .iter()
            .filter(|c| c.created_at >= from && c.created_at <= to)
            .count()
    }

    /// Payable, unflagged commissions oldest first, enough to cover `amount`.
    pub fn payable_covering(&self, amount: i64) -> Vec<CommissionId> {
        let mut payable: Vec<&CommissionEvent> = self
            .commissions
            .iter()
            .filter(|c| c.status == CommissionStatus::Payable && c.flag.is_none())
            .collect();
        payable.sort_by_key(|c| c.created_at);

        let mut covered = 0;
        let mut ids = Vec::new();
        for commission in payable {
            if covered >= amount {
                break;
            }
            covered += commission.amount;
            ids.push(commission.id);
        }
        ids
    }

    fn commission_mut(&mut self, id: &CommissionId) -> Option<&mut CommissionEvent> {
        let i = *self.commission_index.get(id)?;
        self.commissions.get_mut(i)
    }

    fn withdrawal_mut(&mut self, id: &WithdrawalId) -> Option<&mut WithdrawalRequest> {
        let i = *self.withdrawal_index.get(id)?;
        self.withdrawals.get_mut(i)
    }

    fn affiliate_id(&self) -> AffiliateId {
        self.account
            .as_ref()
            .map(|a| a.affiliate_id.clone())
            .unwrap_or_else(|| AffiliateId::new(""))
    }
}

impl Aggregate for AffiliateState {
    const DOMAIN: &'static str = "affiliate";

    fn apply(&mut self, page: &EventPage) {
        match &page.event {
            LedgerEvent::AccountRegistered {
                affiliate_id,
                program,
                client_code,
                recruitment_code,
                registered_at,
            } => {
                self.account = Some(AffiliateAccount {
                    affiliate_id: affiliate_id.clone(),
                    program: *program,
                    client_code: client_code.clone(),
                    recruitment_code: recruitment_code.clone(),
                    registered_at: *registered_at,
                    status: AccountStatus::Active,
                    kyc: KycStatus::Unverified,
                    confirmation_handle: None,
                    payment_details: None,
                });
            }
            LedgerEvent::AccountStatusChanged { status, .. } => {
                if let Some(account) = &mut self.account {
                    account.status = *status;
                }
            }
            LedgerEvent::KycVerified { .. } => {
                if let Some(account) = &mut self.account {
                    account.kyc = KycStatus::Verified;
                }
            }
            LedgerEvent::ConfirmationChannelLinked { handle, .. } => {
                if let Some(account) = &mut self.account {
                    account.confirmation_handle = Some(handle.clone());
                }
            }
            LedgerEvent::PaymentDetailsUpdated { details, .. } => {
                if let Some(account) = &mut self.account {
                    account.payment_details = Some(details.clone());
                }
            }

            LedgerEvent::CommissionCredited {
                commission_id,
                kind,
                amount,
                currency,
                source_event_id,
                origin_event_id,
                actor_id,
                recruit_id,
                flag,
                at,
            } => {
                let i = self.commissions.len();
                let affiliate_id = self.affiliate_id();
                self.commissions.push(CommissionEvent {
                    id: *commission_id,
                    affiliate_id,
                    kind: *kind,
                    amount: *amount,
                    currency: currency.clone(),
                    source_event_id: source_event_id.clone(),
                    origin_event_id: origin_event_id.clone(),
                    actor_id: actor_id.clone(),
                    recruit_id: recruit_id.clone(),
                    status: CommissionStatus::Pending,
                    flag: flag.clone(),
                    created_at: *at,
                    validated_at: None,
                    payable_at: None,
                    paid_at: None,
                    cancelled_at: None,
                    cancellation_reason: None,
                    clawback_at: None,
                    withdrawal_id: None,
                    payout_ref: None,
                });
                self.commission_index.insert(*commission_id, i);
                self.source_index.insert(source_event_id.clone(), i);
            }
            LedgerEvent::CommissionFlagged {
                commission_id,
                reason,
                ..
            } => {
                if let Some(c) = self.commission_mut(commission_id) {
                    c.flag = Some(reason.clone());
                }
            }
            LedgerEvent::CommissionFlagCleared { commission_id, .. } => {
                if let Some(c) = self.commission_mut(commission_id) {
                    c.flag = None;
                }
            }
            LedgerEvent::CommissionValidated { commission_id, at } => {
                if let Some(c) = self.commission_mut(commission_id) {
                    c.status = CommissionStatus::Validated;
                    c.validated_at = Some(*at);
                }
            }
            LedgerEvent::CommissionPayable { commission_id, at } => {
                if let Some(c) = self.commission_mut(commission_id) {
                    c.status = CommissionStatus::Payable;
                    c.payable_at = Some(*at);
                }
            }
            LedgerEvent::CommissionPaid {
                commission_id,
                withdrawal_id,
                payout_ref,
                at,
            } => {
                if let Some(c) = self.commission_mut(commission_id) {
                    c.status = CommissionStatus::Paid;
                    c.paid_at = Some(*at);
                    c.withdrawal_id = *withdrawal_id;
                    c.payout_ref = payout_ref.clone();
                }
                if let Some(w) = withdrawal_id.and_then(|id| self.withdrawal_mut(&id)) {
                    w.covered_commissions.push(*commission_id);
                }
            }
            LedgerEvent::CommissionCancelled {
                commission_id,
                reason,
                at,
            } => {
                if let Some(c) = self.commission_mut(commission_id) {
                    c.status = CommissionStatus::Cancelled;
                    c.cancelled_at = Some(*at);
                    c.cancellation_reason = Some(reason.clone());
                }
            }
            LedgerEvent::CommissionClawedBack {
                commission_id, at, ..
            } => {
                if let Some(c) = self.commission_mut(commission_id) {
                    c.status = CommissionStatus::ClawedBack;
                    c.clawback_at = Some(*at);
                }
            }

            LedgerEvent::WithdrawalRequested {
                withdrawal_id,
                amount,
                method,
                at,
            } => {
                let i = self.withdrawals.len();
                let affiliate_id = self.affiliate_id();
                self.withdrawals.push(WithdrawalRequest {
                    id: *withdrawal_id,
                    affiliate_id,
                    amount: *amount,
                    method: *method,
                    status: WithdrawalStatus::Requested,
                    confirmation_ref: None,
                    confirmation_deadline: None,
                    payout_ref: None,
                    reason: None,
                    covered_commissions: Vec::new(),
                    created_at: *at,
                    processed_at: None,
                });
                self.withdrawal_index.insert(*withdrawal_id, i);
            }
            LedgerEvent::WithdrawalAwaitingConfirmation {
                withdrawal_id,
                confirmation_ref,
                deadline,
                ..
            } => {
                if let Some(w) = self.withdrawal_mut(withdrawal_id) {
                    w.status = WithdrawalStatus::PendingConfirmation;
                    w.confirmation_ref = Some(confirmation_ref.clone());
                    w.confirmation_deadline = Some(*deadline);
                }
            }
            LedgerEvent::WithdrawalConfirmed { withdrawal_id, .. } => {
                if let Some(w) = self.withdrawal_mut(withdrawal_id) {
                    w.status = WithdrawalStatus::Confirmed;
                }
            }
            LedgerEvent::WithdrawalApproved { withdrawal_id, .. } => {
                if let Some(w) = self.withdrawal_mut(withdrawal_id) {
                    w.status = WithdrawalStatus::Approved;
                }
            }
            LedgerEvent::WithdrawalProcessing { withdrawal_id, .. } => {
                if let Some(w) = self.withdrawal_mut(withdrawal_id) {
                    w.status = WithdrawalStatus::Processing;
                }
            }
            LedgerEvent::WithdrawalCompleted {
                withdrawal_id,
                payout_ref,
                at,
            } => {
                if let Some(w) = self.withdrawal_mut(withdrawal_id) {
                    w.status = WithdrawalStatus::Completed;
                    w.payout_ref = Some(payout_ref.clone());
                    w.processed_at = Some(*at);
                }
            }
            LedgerEvent::WithdrawalClosed {
                withdrawal_id,
                status,
                reason,
                at,
            } => {
                if let Some(w) = self.withdrawal_mut(withdrawal_id) {
                    w.status = *status;
                    w.reason = reason.clone();
                    w.processed_at = Some(*at);
                }
            }

            LedgerEvent::EdgeCreated { .. }
            | LedgerEvent::RecruitBonusFired { .. }
            | LedgerEvent::ClickRecorded { .. }
            | LedgerEvent::DeviceObserved { .. }
            | LedgerEvent::IndexLinked { .. } => {}
        }
    }
}
