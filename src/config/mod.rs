//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod client;
mod ledger;
mod policy;
mod program;
mod storage;
mod workflow;

pub use client::{ClientsConfig, ServiceEndpoint};
pub use ledger::{
    LedgerConfig, RetryConfig, SettlementPolicy, DEFAULT_CLAWBACK_WINDOW_MONTHS,
    DEFAULT_HOLD_DAYS, DEFAULT_RECRUIT_BONUS_THRESHOLD, DEFAULT_REFERRAL_WINDOW_MONTHS,
};
pub use policy::{AttributionConfig, FraudConfig, LeaderboardConfig};
pub use program::{ProgramConfig, ProgramsConfig, TierAmounts};
pub use storage::{StorageConfig, StorageType};
pub use workflow::{SchedulerConfig, WithdrawalConfig};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "LEDGER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "LEDGER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "LEDGER_LOG";

/// Upper bound for day-valued durations.
pub const MAX_DAYS: u64 = 3_650;
/// Upper bound for the fraud velocity window.
pub const MAX_VELOCITY_WINDOW_SECS: u64 = 30 * 86_400;
/// Upper bound for the withdrawal confirmation wait.
pub const MAX_CONFIRMATION_TIMEOUT_SECS: u64 = 7 * 86_400;

/// Configuration rejected after loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub programs: ProgramsConfig,
    pub attribution: AttributionConfig,
    pub fraud: FraudConfig,
    pub withdrawal: WithdrawalConfig,
    pub leaderboard: LeaderboardConfig,
    pub scheduler: SchedulerConfig,
    pub clients: ClientsConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Create config for testing: in-memory storage, scheduler off.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig::memory(),
            scheduler: SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Reject settings the ledger cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, program) in [
            ("group_admin", &self.programs.group_admin),
            ("blogger", &self.programs.blogger),
            ("chatter", &self.programs.chatter),
        ] {
            if program.min_withdrawal <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "programs.{name}.min_withdrawal must be positive"
                )));
            }
            if program.direct_call < 0
                || program.provider_recruit_call.n1 < 0
                || program.provider_recruit_call.n2 < 0
                || program.recruit_bonus.n1 < 0
                || program.recruit_bonus.n2 < 0
            {
                return Err(ConfigError::Invalid(format!(
                    "programs.{name} amounts must not be negative"
                )));
            }
        }
        if self.fraud.velocity_flag > self.fraud.velocity_block {
            return Err(ConfigError::Invalid(
                "fraud.velocity_flag exceeds fraud.velocity_block".to_string(),
            ));
        }
        if self.fraud.cluster_flag > self.fraud.cluster_block {
            return Err(ConfigError::Invalid(
                "fraud.cluster_flag exceeds fraud.cluster_block".to_string(),
            ));
        }
        if !(1..=28).contains(&self.scheduler.payout_day) {
            return Err(ConfigError::Invalid(
                "scheduler.payout_day must be between 1 and 28".to_string(),
            ));
        }
        for (name, value, max) in [
            ("ledger.hold_days", u64::from(self.ledger.hold_days), MAX_DAYS),
            ("attribution.cookie_days", u64::from(self.attribution.cookie_days), MAX_DAYS),
            (
                "fraud.velocity_window_secs",
                self.fraud.velocity_window_secs,
                MAX_VELOCITY_WINDOW_SECS,
            ),
            (
                "withdrawal.confirmation_timeout_secs",
                self.withdrawal.confirmation_timeout_secs,
                MAX_CONFIRMATION_TIMEOUT_SECS,
            ),
        ] {
            if value > max {
                return Err(ConfigError::Invalid(format!("{name} must be at most {max}")));
            }
        }
        if self.ledger.retry.max_attempts == 0 || self.withdrawal.rail_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
