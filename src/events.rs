//! Ledger event vocabulary.
//!
//! One closed enum covers every stream in the store. Each aggregate folds the
//! variants it owns and ignores the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    AccountStatus, AffiliateId, AttributionCookie, Cents, CommissionId, CommissionKind,
    PaymentDetails, PaymentMethod, ProgramType, ReferralEdge, WithdrawalId, WithdrawalStatus,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    // ---- Account ----
    AccountRegistered {
        affiliate_id: AffiliateId,
        program: ProgramType,
        client_code: String,
        recruitment_code: String,
        registered_at: DateTime<Utc>,
    },
    AccountStatusChanged {
        status: AccountStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    KycVerified {
        at: DateTime<Utc>,
    },
    ConfirmationChannelLinked {
        handle: String,
        at: DateTime<Utc>,
    },
    PaymentDetailsUpdated {
        details: PaymentDetails,
        at: DateTime<Utc>,
    },

    // ---- Commission lifecycle ----
    CommissionCredited {
        commission_id: CommissionId,
        kind: CommissionKind,
        amount: Cents,
        currency: String,
        source_event_id: String,
        origin_event_id: String,
        #[serde(default)]
        actor_id: Option<AffiliateId>,
        #[serde(default)]
        recruit_id: Option<AffiliateId>,
        flag: Option<String>,
        at: DateTime<Utc>,
    },
    CommissionFlagged {
        commission_id: CommissionId,
        reason: String,
        at: DateTime<Utc>,
    },
    CommissionFlagCleared {
        commission_id: CommissionId,
        reviewer: String,
        at: DateTime<Utc>,
    },
    CommissionValidated {
        commission_id: CommissionId,
        at: DateTime<Utc>,
    },
    CommissionPayable {
        commission_id: CommissionId,
        at: DateTime<Utc>,
    },
    CommissionPaid {
        commission_id: CommissionId,
        withdrawal_id: Option<WithdrawalId>,
        payout_ref: Option<String>,
        at: DateTime<Utc>,
    },
    CommissionCancelled {
        commission_id: CommissionId,
        reason: String,
        at: DateTime<Utc>,
    },
    CommissionClawedBack {
        commission_id: CommissionId,
        refund_id: String,
        at: DateTime<Utc>,
    },

    // ---- Withdrawal lifecycle ----
    WithdrawalRequested {
        withdrawal_id: WithdrawalId,
        amount: Cents,
        method: PaymentMethod,
        at: DateTime<Utc>,
    },
    WithdrawalAwaitingConfirmation {
        withdrawal_id: WithdrawalId,
        confirmation_ref: String,
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    WithdrawalConfirmed {
        withdrawal_id: WithdrawalId,
        at: DateTime<Utc>,
    },
    WithdrawalApproved {
        withdrawal_id: WithdrawalId,
        approved_by: Option<String>,
        at: DateTime<Utc>,
    },
    WithdrawalProcessing {
        withdrawal_id: WithdrawalId,
        at: DateTime<Utc>,
    },
    WithdrawalCompleted {
        withdrawal_id: WithdrawalId,
        payout_ref: String,
        at: DateTime<Utc>,
    },
    /// Terminal outcome other than completion (rejected, failed, cancelled, expired).
    WithdrawalClosed {
        withdrawal_id: WithdrawalId,
        status: WithdrawalStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    },

    // ---- Referral graph ----
    EdgeCreated {
        edge: ReferralEdge,
    },
    RecruitBonusFired {
        parent: AffiliateId,
        child: AffiliateId,
        commission_id: CommissionId,
        at: DateTime<Utc>,
    },

    // ---- Attribution ----
    ClickRecorded {
        cookie: AttributionCookie,
    },

    // ---- Fraud signals ----
    DeviceObserved {
        account_id: AffiliateId,
        at: DateTime<Utc>,
    },

    // ---- Lookup indexes ----
    IndexLinked {
        value: String,
    },
}

impl LedgerEvent {
    /// Event type name, used in logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            LedgerEvent::AccountRegistered { .. } => "account_registered",
            LedgerEvent::AccountStatusChanged { .. } => "account_status_changed",
            LedgerEvent::KycVerified { .. } => "kyc_verified",
            LedgerEvent::ConfirmationChannelLinked { .. } => "confirmation_channel_linked",
            LedgerEvent::PaymentDetailsUpdated { .. } => "payment_details_updated",
            LedgerEvent::CommissionCredited { .. } => "commission_credited",
            LedgerEvent::CommissionFlagged { .. } => "commission_flagged",
            LedgerEvent::CommissionFlagCleared { .. } => "commission_flag_cleared",
            LedgerEvent::CommissionValidated { .. } => "commission_validated",
            LedgerEvent::CommissionPayable { .. } => "commission_payable",
            LedgerEvent::CommissionPaid { .. } => "commission_paid",
            LedgerEvent::CommissionCancelled { .. } => "commission_cancelled",
            LedgerEvent::CommissionClawedBack { .. } => "commission_clawed_back",
            LedgerEvent::WithdrawalRequested { .. } => "withdrawal_requested",
            LedgerEvent::WithdrawalAwaitingConfirmation { .. } => {
                "withdrawal_awaiting_confirmation"
            }
            LedgerEvent::WithdrawalConfirmed { .. } => "withdrawal_confirmed",
            LedgerEvent::WithdrawalApproved { .. } => "withdrawal_approved",
            LedgerEvent::WithdrawalProcessing { .. } => "withdrawal_processing",
            LedgerEvent::WithdrawalCompleted { .. } => "withdrawal_completed",
            LedgerEvent::WithdrawalClosed { .. } => "withdrawal_closed",
            LedgerEvent::EdgeCreated { .. } => "edge_created",
            LedgerEvent::RecruitBonusFired { .. } => "recruit_bonus_fired",
            LedgerEvent::ClickRecorded { .. } => "click_recorded",
            LedgerEvent::DeviceObserved { .. } => "device_observed",
            LedgerEvent::IndexLinked { .. } => "index_linked",
        }
    }

    /// Whether this event changes payable or paid amounts (leaderboard inputs).
    pub fn affects_earnings(&self) -> bool {
        matches!(
            self,
            LedgerEvent::CommissionPayable { .. }
                | LedgerEvent::CommissionPaid { .. }
                | LedgerEvent::CommissionCancelled { .. }
                | LedgerEvent::CommissionClawedBack { .. }
        )
    }
}
