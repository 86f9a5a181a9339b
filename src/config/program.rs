//! Per-program commission amounts and withdrawal rules.
//!
//! All amounts are USD cents.

use serde::Deserialize;

use crate::model::{ProgramType, Tier};

/// An amount per recruitment tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TierAmounts {
    pub n1: i64,
    pub n2: i64,
}

impl TierAmounts {
    pub fn for_tier(&self, tier: Tier) -> i64 {
        match tier {
            Tier::N1 => self.n1,
            Tier::N2 => self.n2,
        }
    }
}

/// Rules for one partner program.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    /// Paid to the attributed affiliate for each completed client call.
    pub direct_call: i64,
    /// Paid to recruiters when a provider they recruited completes a call.
    pub provider_recruit_call: TierAmounts,
    /// One-time bonus when a recruit crosses the earnings threshold. Zero skips the tier.
    pub recruit_bonus: TierAmounts,
    pub min_withdrawal: i64,
    /// Withdrawals wait for the affiliate to confirm on the linked channel.
    pub confirmation_required: bool,
    /// Withdrawals wait for an operator to approve.
    pub manual_approval: bool,
}

impl ProgramConfig {
    fn with_min_withdrawal(min_withdrawal: i64) -> Self {
        Self {
            min_withdrawal,
            ..Self::default()
        }
    }
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            direct_call: 1_000,
            provider_recruit_call: TierAmounts { n1: 500, n2: 100 },
            recruit_bonus: TierAmounts { n1: 5_000, n2: 0 },
            min_withdrawal: 2_500,
            confirmation_required: true,
            manual_approval: false,
        }
    }
}

/// Rules for every program.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgramsConfig {
    pub group_admin: ProgramConfig,
    pub blogger: ProgramConfig,
    pub chatter: ProgramConfig,
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            group_admin: ProgramConfig::with_min_withdrawal(2_500),
            blogger: ProgramConfig::with_min_withdrawal(2_000),
            chatter: ProgramConfig::with_min_withdrawal(3_000),
        }
    }
}

impl ProgramsConfig {
    pub fn for_program(&self, program: ProgramType) -> &ProgramConfig {
        match program {
            ProgramType::GroupAdmin => &self.group_admin,
            ProgramType::Blogger => &self.blogger,
            ProgramType::Chatter => &self.chatter,
        }
    }
}
