//! Outbound collaborator interfaces.
//!
//! The ledger orchestrates, but does not implement, human confirmation,
//! money movement, and identity verification. These traits are the seams.

use async_trait::async_trait;

use crate::model::{AffiliateId, Cents, PaymentDetails, PaymentMethod, WithdrawalId};

/// Result type for external client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors returned by external collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Client configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Transient failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Unavailable(_) => true,
            ClientError::Http(err) => err.is_timeout() || err.is_connect(),
            ClientError::Rejected(_) | ClientError::Config(_) => false,
        }
    }
}

/// Human confirmation channel (Telegram bot).
///
/// The ledger never blocks on the human: it records the returned reference and
/// waits for a `confirmed`/`cancelled` callback or the scheduled expiry.
#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    /// Ask the affiliate to confirm a withdrawal. Returns the confirmation reference.
    async fn request_confirmation(
        &self,
        withdrawal_id: WithdrawalId,
        affiliate_id: &AffiliateId,
        handle: &str,
        amount: Cents,
    ) -> Result<String>;
}

/// Outcome of a disbursement call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutReceipt {
    pub payout_ref: String,
    /// Whether the rail confirmed the transfer synchronously. When false the
    /// withdrawal stays `processing` until the rail's callback settles it.
    pub settled: bool,
}

/// Money-movement rail (Wise, PayPal, mobile money, bank transfer).
#[async_trait]
pub trait PayoutRail: Send + Sync {
    async fn disburse(
        &self,
        withdrawal_id: WithdrawalId,
        affiliate_id: &AffiliateId,
        amount: Cents,
        method: PaymentMethod,
        details: Option<&PaymentDetails>,
    ) -> Result<PayoutReceipt>;
}

/// Identity verification provider.
#[async_trait]
pub trait KycVerifier: Send + Sync {
    async fn is_verified(&self, affiliate_id: &AffiliateId) -> Result<bool>;
}
