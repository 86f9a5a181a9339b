//! Attribution, fraud screening, and leaderboard tuning.

use serde::Deserialize;

/// Attribution cookie configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    pub cookie_days: u32,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self { cookie_days: 30 }
    }
}

/// Fraud heuristics thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FraudConfig {
    pub velocity_window_secs: u64,
    pub velocity_flag: usize,
    pub velocity_block: usize,
    /// Children of one parent sharing a device fingerprint.
    pub cluster_flag: usize,
    pub cluster_block: usize,
    /// Clicks converting faster than this are implausible.
    pub min_click_to_action_secs: u64,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            velocity_window_secs: 3_600,
            velocity_flag: 20,
            velocity_block: 60,
            cluster_flag: 3,
            cluster_block: 5,
            min_click_to_action_secs: 3,
        }
    }
}

/// Leaderboard configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaderboardConfig {
    pub size: usize,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self { size: 10 }
    }
}
