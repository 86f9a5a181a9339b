//! Ledger data model.
//!
//! Every type here is either stored inside a [`LedgerEvent`](crate::events::LedgerEvent)
//! or folded from the event log. Nothing in this module is a source of truth on
//! its own: balances and statuses are always recomputed from events.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Amount in USD cents.
///
/// Commission amounts are fixed per program and independent of the call price,
/// so sums across commissions are always currency-safe.
pub type Cents = i64;

/// Commission identifier.
pub type CommissionId = Uuid;

/// Withdrawal request identifier.
pub type WithdrawalId = Uuid;

/// UUID namespace for deterministic stream roots.
pub static LEDGER_UUID_NAMESPACE: LazyLock<Uuid> =
    LazyLock::new(|| Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"commission-ledger.dev"));

/// Deterministic stream root for a keyed entity (`"affiliate"`, `"visitor"`, ...).
pub fn stream_root(kind: &str, key: &str) -> Uuid {
    let mut name = Vec::with_capacity(kind.len() + key.len() + 1);
    name.extend_from_slice(kind.as_bytes());
    name.push(b':');
    name.extend_from_slice(key.as_bytes());
    Uuid::new_v5(&LEDGER_UUID_NAMESPACE, &name)
}

/// Affiliate identifier (the auth UID of the partner account).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AffiliateId(String);

impl AffiliateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Root of this affiliate's event stream.
    pub fn root(&self) -> Uuid {
        stream_root("affiliate", &self.0)
    }
}

impl fmt::Display for AffiliateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AffiliateId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AffiliateId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Partner program an affiliate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramType {
    GroupAdmin,
    Blogger,
    Chatter,
}

impl ProgramType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramType::GroupAdmin => "group_admin",
            ProgramType::Blogger => "blogger",
            ProgramType::Chatter => "chatter",
        }
    }
}

/// Account status. Only active accounts earn commissions or withdraw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
    Blocked,
}

/// Identity verification state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    Unverified,
    Verified,
}

/// Recruitment tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    N1,
    N2,
}

impl Tier {
    pub fn level(&self) -> u8 {
        match self {
            Tier::N1 => 1,
            Tier::N2 => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::N1 => f.write_str("N1"),
            Tier::N2 => f.write_str("N2"),
        }
    }
}

/// Closed set of commission kinds. New kinds need an explicit variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionKind {
    /// A referred client completed a paid call.
    DirectCall,
    /// A provider recruited by the affiliate completed a paid call.
    ProviderRecruitCall,
    /// One-time bonus when a recruited admin crosses the earnings threshold.
    AdminRecruitBonus,
}

impl CommissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionKind::DirectCall => "direct_call",
            CommissionKind::ProviderRecruitCall => "provider_recruit_call",
            CommissionKind::AdminRecruitBonus => "admin_recruit_bonus",
        }
    }

    /// Whether crediting this kind goes through the referral graph.
    pub fn is_recruitment(&self) -> bool {
        match self {
            CommissionKind::DirectCall => false,
            CommissionKind::ProviderRecruitCall | CommissionKind::AdminRecruitBonus => true,
        }
    }
}

/// Commission lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Validated,
    Payable,
    Paid,
    Cancelled,
    ClawedBack,
}

impl CommissionStatus {
    /// Statuses a refund cancels outright (money never left).
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            CommissionStatus::Pending | CommissionStatus::Validated | CommissionStatus::Payable
        )
    }

    /// Statuses that count toward a recruit's bonus threshold.
    pub fn counts_as_earned(&self) -> bool {
        matches!(
            self,
            CommissionStatus::Validated | CommissionStatus::Payable | CommissionStatus::Paid
        )
    }
}

/// A single commission, folded from the affiliate's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionEvent {
    pub id: CommissionId,
    pub affiliate_id: AffiliateId,
    pub kind: CommissionKind,
    pub amount: Cents,
    pub currency: String,
    pub source_event_id: String,
    /// External event this commission derives from (refunds are matched on it).
    pub origin_event_id: String,
    /// Party whose action produced the commission (the paying client), when known.
    pub actor_id: Option<AffiliateId>,
    /// Recruited account a recruitment commission derives from.
    pub recruit_id: Option<AffiliateId>,
    pub status: CommissionStatus,
    /// Fraud flag awaiting manual review. Blocks validation while set.
    pub flag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub payable_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub clawback_at: Option<DateTime<Utc>>,
    pub withdrawal_id: Option<WithdrawalId>,
    pub payout_ref: Option<String>,
}

/// Withdrawal lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Requested,
    PendingConfirmation,
    Confirmed,
    Approved,
    Processing,
    Completed,
    Rejected,
    Failed,
    Cancelled,
    Expired,
}

impl WithdrawalStatus {
    /// Non-terminal statuses. The requested amount stays reserved while active.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Requested
                | WithdrawalStatus::PendingConfirmation
                | WithdrawalStatus::Confirmed
                | WithdrawalStatus::Approved
                | WithdrawalStatus::Processing
        )
    }

    /// Statuses that may still be cancelled, rejected, or expired.
    pub fn is_pre_processing(&self) -> bool {
        self.is_active() && *self != WithdrawalStatus::Processing
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Requested => "requested",
            WithdrawalStatus::PendingConfirmation => "pending_confirmation",
            WithdrawalStatus::Confirmed => "confirmed",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Rejected => "rejected",
            WithdrawalStatus::Failed => "failed",
            WithdrawalStatus::Cancelled => "cancelled",
            WithdrawalStatus::Expired => "expired",
        }
    }
}

/// Payout method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Wise,
    Paypal,
    MobileMoney,
    BankTransfer,
}

/// Payment details captured with the account, varying by method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentDetails {
    Wise {
        email: String,
        account_holder_name: String,
        currency: String,
    },
    Paypal {
        email: String,
    },
    MobileMoney {
        provider: String,
        phone_number: String,
        country: String,
    },
    BankTransfer {
        account_holder_name: String,
        bank_name: String,
        account_number: String,
        iban: Option<String>,
        swift_code: Option<String>,
        country: String,
    },
}

impl PaymentDetails {
    pub fn method(&self) -> PaymentMethod {
        match self {
            PaymentDetails::Wise { .. } => PaymentMethod::Wise,
            PaymentDetails::Paypal { .. } => PaymentMethod::Paypal,
            PaymentDetails::MobileMoney { .. } => PaymentMethod::MobileMoney,
            PaymentDetails::BankTransfer { .. } => PaymentMethod::BankTransfer,
        }
    }
}

/// A withdrawal request, folded from the affiliate's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: WithdrawalId,
    pub affiliate_id: AffiliateId,
    pub amount: Cents,
    pub method: PaymentMethod,
    pub status: WithdrawalStatus,
    pub confirmation_ref: Option<String>,
    pub confirmation_deadline: Option<DateTime<Utc>>,
    pub payout_ref: Option<String>,
    pub reason: Option<String>,
    pub covered_commissions: Vec<CommissionId>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Directed recruitment edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralEdge {
    pub parent: AffiliateId,
    pub child: AffiliateId,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Hashed device fingerprint seen when the child registered.
    pub fingerprint: Option<String>,
}

impl ReferralEdge {
    /// Whether `at` falls inside `[created_at, window_end]`.
    pub fn is_within_window(&self, at: DateTime<Utc>) -> bool {
        at >= self.created_at && at <= self.window_end
    }
}

/// Navigation context captured with a click.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickContext {
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    /// Hashed client address.
    pub ip_hash: Option<String>,
}

impl ClickContext {
    /// A click with neither a referrer nor a user agent has no plausible navigation.
    pub fn has_navigation(&self) -> bool {
        self.referrer.as_deref().is_some_and(|r| !r.is_empty())
            || self.user_agent.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Last-click attribution cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionCookie {
    pub visitor_id: String,
    pub affiliate_id: AffiliateId,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub context: Option<ClickContext>,
}

impl AttributionCookie {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now >= self.created_at && now < self.expires_at
    }
}
