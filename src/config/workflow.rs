//! Withdrawal workflow and scheduler configuration.

use serde::Deserialize;

/// Withdrawal workflow configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WithdrawalConfig {
    /// Global switch. When false every new request is refused.
    pub enabled: bool,
    pub confirmation_timeout_secs: u64,
    /// Payout rail retries before the withdrawal fails.
    pub rail_max_attempts: usize,
    pub rail_min_delay_ms: u64,
    pub rail_max_delay_ms: u64,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confirmation_timeout_secs: 600,
            rail_max_attempts: 3,
            rail_min_delay_ms: 500,
            rail_max_delay_ms: 10_000,
        }
    }
}

/// Periodic job configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// How often due work is checked.
    pub tick_secs: u64,
    /// Day of month (1-28) on which validated commissions become payable.
    pub payout_day: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 60,
            payout_day: 1,
        }
    }
}
