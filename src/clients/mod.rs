//! External service clients.
//!
//! HTTP adapters for the confirmation channel, payout rail, and KYC verifier,
//! plus in-process fakes selected when an endpoint is not configured.

pub mod http;
pub mod mock;

use std::sync::Arc;

use tracing::warn;

use crate::config::ClientsConfig;
use crate::interfaces::external::{ClientError, ConfirmationChannel, KycVerifier, PayoutRail};

pub use http::{HttpConfirmationChannel, HttpKycVerifier, HttpPayoutRail};
pub use mock::{MockConfirmationChannel, MockKycVerifier, MockPayoutRail};

/// The three outbound collaborators the withdrawal workflow drives.
#[derive(Clone)]
pub struct ExternalClients {
    pub confirmation: Arc<dyn ConfirmationChannel>,
    pub payout: Arc<dyn PayoutRail>,
    pub kyc: Arc<dyn KycVerifier>,
}

impl ExternalClients {
    /// Build clients from configuration. Missing endpoints get the fakes.
    pub fn from_config(config: &ClientsConfig) -> Result<Self, ClientError> {
        let confirmation: Arc<dyn ConfirmationChannel> = match &config.confirmation {
            Some(endpoint) => Arc::new(HttpConfirmationChannel::new(endpoint)?),
            None => {
                warn!("No confirmation endpoint configured, using in-process fake");
                Arc::new(MockConfirmationChannel::new())
            }
        };
        let payout: Arc<dyn PayoutRail> = match &config.payout {
            Some(endpoint) => Arc::new(HttpPayoutRail::new(endpoint)?),
            None => {
                warn!("No payout endpoint configured, using in-process fake");
                Arc::new(MockPayoutRail::new())
            }
        };
        let kyc: Arc<dyn KycVerifier> = match &config.kyc {
            Some(endpoint) => Arc::new(HttpKycVerifier::new(endpoint)?),
            None => {
                warn!("No KYC endpoint configured, using in-process fake");
                Arc::new(MockKycVerifier::new())
            }
        };
        Ok(Self {
            confirmation,
            payout,
            kyc,
        })
    }
}
