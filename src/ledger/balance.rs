//! Balance derived from the affiliate's commissions and withdrawals.

use serde::Serialize;

use crate::model::{Cents, CommissionEvent, CommissionStatus, WithdrawalRequest, WithdrawalStatus};

/// Balance breakdown, recomputed from the event log on every read.
///
/// `available = max(payable + paid - withdrawn - reserved, 0)`. Clawed-back
/// commissions leave the paid sum, so money already withdrawn against them
/// drives the raw figure negative; that shortfall is reported as
/// `outstanding_clawback` and recovered from future earnings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub pending: Cents,
    pub validated: Cents,
    pub payable: Cents,
    pub paid: Cents,
    pub clawed_back: Cents,
    /// Completed withdrawals.
    pub withdrawn: Cents,
    /// Active withdrawals.
    pub reserved: Cents,
    pub outstanding_clawback: Cents,
    pub available: Cents,
}

impl Balance {
    pub fn compute(commissions: &[CommissionEvent], withdrawals: &[WithdrawalRequest]) -> Self {
        let mut balance = Balance::default();
        for commission in commissions {
            let bucket = match commission.status {
                CommissionStatus::Pending => &mut balance.pending,
                CommissionStatus::Validated => &mut balance.validated,
                CommissionStatus::Payable => &mut balance.payable,
                CommissionStatus::Paid => &mut balance.paid,
                CommissionStatus::ClawedBack => &mut balance.clawed_back,
                CommissionStatus::Cancelled => continue,
            };
            *bucket += commission.amount;
        }
        for withdrawal in withdrawals {
            if withdrawal.status == WithdrawalStatus::Completed {
                balance.withdrawn += withdrawal.amount;
            } else if withdrawal.status.is_active() {
                balance.reserved += withdrawal.amount;
            }
        }

        let raw = balance.payable + balance.paid - balance.withdrawn - balance.reserved;
        balance.available = raw.max(0);
        balance.outstanding_clawback = (-raw).max(0);
        balance
    }

    /// Lifetime earnings that reached payable or paid.
    pub fn total_earned(&self) -> Cents {
        self.payable + self.paid
    }
}
