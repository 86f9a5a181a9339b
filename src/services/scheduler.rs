//! Periodic ledger jobs.
//!
//! Every tick the scheduler:
//! 1. Validates pending commissions past their hold
//! 2. Releases validated commissions to payable once per month, on or after the payout day
//! 3. Runs automatic payouts (no-op under the on-request policy)
//! 4. Expires withdrawals whose confirmation deadline passed
//!
//! Each job is idempotent, so a missed or repeated tick only delays work.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{error, info};

use crate::config::SchedulerConfig;
use crate::ledger::{CommissionLedger, ValidationReport};
use crate::withdrawal::WithdrawalWorkflow;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub validation: ValidationReport,
    pub released: usize,
    pub automatic_payouts: usize,
    pub expired: usize,
}

impl TickReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Scheduler {
    ledger: Arc<CommissionLedger>,
    withdrawals: Arc<WithdrawalWorkflow>,
    config: SchedulerConfig,
    /// (year, month) of the last payout release.
    last_release: Mutex<Option<(i32, u32)>>,
}

impl Scheduler {
    pub fn new(
        ledger: Arc<CommissionLedger>,
        withdrawals: Arc<WithdrawalWorkflow>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ledger,
            withdrawals,
            config,
            last_release: Mutex::new(None),
        }
    }

    /// Whether the monthly release is due at `now`, claiming it if so.
    async fn claim_release(&self, now: DateTime<Utc>) -> bool {
        if now.day() < self.config.payout_day {
            return false;
        }
        let month = (now.year(), now.month());
        let mut last = self.last_release.lock().await;
        if *last == Some(month) {
            return false;
        }
        *last = Some(month);
        true
    }

    /// Run every due job once. A failing job is logged and does not stop the others.
    #[tracing::instrument(name = "scheduler.tick", skip_all, fields(%now))]
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match self.ledger.validate_matured(now).await {
            Ok(validation) => report.validation = validation,
            Err(e) => error!(error = %e, "Validation pass failed"),
        }

        if self.claim_release(now).await {
            match self.ledger.release_payable(now).await {
                Ok(released) => report.released = released,
                Err(e) => {
                    error!(error = %e, "Payout release failed");
                    *self.last_release.lock().await = None;
                }
            }
        }

        match self.withdrawals.run_automatic_payouts(now).await {
            Ok(paid) => report.automatic_payouts = paid,
            Err(e) => error!(error = %e, "Automatic payouts failed"),
        }

        match self.withdrawals.expire_stale(now).await {
            Ok(expired) => report.expired = expired,
            Err(e) => error!(error = %e, "Confirmation expiry failed"),
        }

        if !report.is_empty() {
            info!(?report, "Scheduler tick");
        }
        report
    }

    /// Run the scheduler loop.
    ///
    /// This runs indefinitely, ticking at the configured interval.
    pub async fn run(&self) {
        info!(
            tick_secs = self.config.tick_secs,
            payout_day = self.config.payout_day,
            "Starting scheduler"
        );
        let mut ticker = interval(Duration::from_secs(self.config.tick_secs.max(1)));
        loop {
            ticker.tick().await;
            self.tick(Utc::now()).await;
        }
    }
}
