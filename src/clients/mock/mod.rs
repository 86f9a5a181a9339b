//! In-process fakes for the outbound collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::interfaces::external::{
    ClientError, ConfirmationChannel, KycVerifier, PayoutRail, PayoutReceipt, Result,
};
use crate::model::{AffiliateId, Cents, PaymentDetails, PaymentMethod, WithdrawalId};

/// A confirmation prompt the fake channel received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationPrompt {
    pub withdrawal_id: WithdrawalId,
    pub affiliate_id: AffiliateId,
    pub handle: String,
    pub amount: Cents,
    pub confirmation_ref: String,
}

/// Fake confirmation channel. Records prompts; the test plays the human.
pub struct MockConfirmationChannel {
    fail_on_request: RwLock<bool>,
    prompts: RwLock<Vec<ConfirmationPrompt>>,
}

impl MockConfirmationChannel {
    pub fn new() -> Self {
        Self {
            fail_on_request: RwLock::new(false),
            prompts: RwLock::new(Vec::new()),
        }
    }

    pub async fn set_fail_on_request(&self, fail: bool) {
        *self.fail_on_request.write().await = fail;
    }

    pub async fn prompts(&self) -> Vec<ConfirmationPrompt> {
        self.prompts.read().await.clone()
    }

    /// Reference sent for the most recent prompt about `withdrawal_id`.
    pub async fn ref_for(&self, withdrawal_id: WithdrawalId) -> Option<String> {
        self.prompts
            .read()
            .await
            .iter()
            .rev()
            .find(|p| p.withdrawal_id == withdrawal_id)
            .map(|p| p.confirmation_ref.clone())
    }
}

impl Default for MockConfirmationChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfirmationChannel for MockConfirmationChannel {
    async fn request_confirmation(
        &self,
        withdrawal_id: WithdrawalId,
        affiliate_id: &AffiliateId,
        handle: &str,
        amount: Cents,
    ) -> Result<String> {
        if *self.fail_on_request.read().await {
            return Err(ClientError::Unavailable(
                "Mock confirmation channel down".to_string(),
            ));
        }
        let confirmation_ref = format!("confirm-{withdrawal_id}");
        self.prompts.write().await.push(ConfirmationPrompt {
            withdrawal_id,
            affiliate_id: affiliate_id.clone(),
            handle: handle.to_string(),
            amount,
            confirmation_ref: confirmation_ref.clone(),
        });
        Ok(confirmation_ref)
    }
}

/// Fake payout rail.
pub struct MockPayoutRail {
    transient_failures: RwLock<usize>,
    reject: RwLock<bool>,
    deferred_settlement: RwLock<bool>,
    calls: AtomicUsize,
}

impl MockPayoutRail {
    pub fn new() -> Self {
        Self {
            transient_failures: RwLock::new(0),
            reject: RwLock::new(false),
            deferred_settlement: RwLock::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` calls with a transient error.
    pub async fn set_transient_failures(&self, count: usize) {
        *self.transient_failures.write().await = count;
    }

    /// Reject every call permanently.
    pub async fn set_reject(&self, reject: bool) {
        *self.reject.write().await = reject;
    }

    /// Return unsettled receipts; settlement arrives later by callback.
    pub async fn set_deferred_settlement(&self, deferred: bool) {
        *self.deferred_settlement.write().await = deferred;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockPayoutRail {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayoutRail for MockPayoutRail {
    async fn disburse(
        &self,
        withdrawal_id: WithdrawalId,
        _affiliate_id: &AffiliateId,
        _amount: Cents,
        _method: PaymentMethod,
        _details: Option<&PaymentDetails>,
    ) -> Result<PayoutReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.reject.read().await {
            return Err(ClientError::Rejected("Mock rail rejection".to_string()));
        }
        {
            let mut remaining = self.transient_failures.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::Unavailable("Mock rail timeout".to_string()));
            }
        }
        Ok(PayoutReceipt {
            payout_ref: format!("payout-{withdrawal_id}"),
            settled: !*self.deferred_settlement.read().await,
        })
    }
}

/// Fake KYC verifier backed by an allow-list.
pub struct MockKycVerifier {
    verified: RwLock<HashSet<AffiliateId>>,
    fail_on_check: RwLock<bool>,
}

impl MockKycVerifier {
    pub fn new() -> Self {
        Self {
            verified: RwLock::new(HashSet::new()),
            fail_on_check: RwLock::new(false),
        }
    }

    pub async fn set_verified(&self, affiliate_id: &AffiliateId, verified: bool) {
        let mut set = self.verified.write().await;
        if verified {
            set.insert(affiliate_id.clone());
        } else {
            set.remove(affiliate_id);
        }
    }

    pub async fn set_fail_on_check(&self, fail: bool) {
        *self.fail_on_check.write().await = fail;
    }
}

impl Default for MockKycVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KycVerifier for MockKycVerifier {
    async fn is_verified(&self, affiliate_id: &AffiliateId) -> Result<bool> {
        if *self.fail_on_check.read().await {
            return Err(ClientError::Unavailable("Mock KYC provider down".to_string()));
        }
        Ok(self.verified.read().await.contains(affiliate_id))
    }
}
