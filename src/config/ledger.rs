//! Commission lifecycle configuration.

use serde::Deserialize;

/// Default hold before a pending commission may be validated.
pub const DEFAULT_HOLD_DAYS: u32 = 14;
/// Default recruitment earning window.
pub const DEFAULT_REFERRAL_WINDOW_MONTHS: u32 = 12;
/// Default window after payment during which a refund claws back.
pub const DEFAULT_CLAWBACK_WINDOW_MONTHS: u32 = 12;
/// Default recruit earnings (cents) that trigger the one-time recruitment bonus.
pub const DEFAULT_RECRUIT_BONUS_THRESHOLD: i64 = 20_000;

/// How `payable` commissions become `paid`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPolicy {
    /// Only through a withdrawal the affiliate requests.
    #[default]
    OnRequest,
    /// The scheduler withdraws the full available balance each payout cycle.
    Automatic,
}

/// Retry tuning for optimistic-concurrency conflicts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2,
            max_delay_ms: 200,
            max_attempts: 50,
        }
    }
}

/// Commission ledger configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub hold_days: u32,
    pub referral_window_months: u32,
    pub clawback_window_months: u32,
    pub recruit_bonus_threshold: i64,
    pub settlement_policy: SettlementPolicy,
    /// Currency every commission is denominated in.
    pub currency: String,
    pub retry: RetryConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            hold_days: DEFAULT_HOLD_DAYS,
            referral_window_months: DEFAULT_REFERRAL_WINDOW_MONTHS,
            clawback_window_months: DEFAULT_CLAWBACK_WINDOW_MONTHS,
            recruit_bonus_threshold: DEFAULT_RECRUIT_BONUS_THRESHOLD,
            settlement_policy: SettlementPolicy::OnRequest,
            currency: "USD".to_string(),
            retry: RetryConfig::default(),
        }
    }
}
