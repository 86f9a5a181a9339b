//! HTTP adapters for the outbound collaborators.
//!
//! Each collaborator is a small JSON-over-HTTP service. Confirmation and KYC
//! calls retry transient failures with backoff; the payout rail does not,
//! because the withdrawal workflow owns rail retries and records the outcome.

use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ServiceEndpoint;
use crate::interfaces::external::{
    ClientError, ConfirmationChannel, KycVerifier, PayoutRail, PayoutReceipt, Result,
};
use crate::model::{AffiliateId, Cents, PaymentDetails, PaymentMethod, WithdrawalId};
use crate::utils::retry::http_backoff;

/// JSON client bound to one endpoint.
struct JsonClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl JsonClient {
    fn new(endpoint: &ServiceEndpoint) -> Result<Self> {
        if endpoint.url.is_empty() {
            return Err(ClientError::Config("endpoint url not configured".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(endpoint.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            api_key: endpoint.api_key.clone(),
        })
    }

    /// 429 and 5xx are worth another attempt.
    fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    async fn send<Resp: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<Resp> {
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(%url, %status, "External call succeeded");
            return Ok(response.json::<Resp>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!(
            "HTTP {} - {}",
            status,
            body.chars().take(200).collect::<String>()
        );
        if Self::is_retryable_status(status) {
            warn!(%url, %status, "External call returned retryable status");
            Err(ClientError::Unavailable(detail))
        } else {
            warn!(%url, %status, "External call rejected");
            Err(ClientError::Rejected(detail))
        }
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(&self, path: &str, body: &Req) -> Result<Resp> {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.client.post(&url).json(body), &url).await
    }

    async fn get<Resp: DeserializeOwned>(&self, path: &str) -> Result<Resp> {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.client.get(&url), &url).await
    }
}

#[derive(Serialize)]
struct ConfirmationRequest<'a> {
    withdrawal_id: WithdrawalId,
    affiliate_id: &'a AffiliateId,
    handle: &'a str,
    amount_cents: Cents,
}

#[derive(Deserialize)]
struct ConfirmationResponse {
    confirmation_ref: String,
}

/// Confirmation channel served by the chat bot.
pub struct HttpConfirmationChannel {
    client: JsonClient,
}

impl HttpConfirmationChannel {
    pub fn new(endpoint: &ServiceEndpoint) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(endpoint)?,
        })
    }
}

#[async_trait]
impl ConfirmationChannel for HttpConfirmationChannel {
    async fn request_confirmation(
        &self,
        withdrawal_id: WithdrawalId,
        affiliate_id: &AffiliateId,
        handle: &str,
        amount: Cents,
    ) -> Result<String> {
        let body = ConfirmationRequest {
            withdrawal_id,
            affiliate_id,
            handle,
            amount_cents: amount,
        };
        let response: ConfirmationResponse = (|| async {
            self.client.post("/confirmations", &body).await
        })
        .retry(http_backoff())
        .when(ClientError::is_transient)
        .await?;
        Ok(response.confirmation_ref)
    }
}

#[derive(Serialize)]
struct DisburseRequest<'a> {
    withdrawal_id: WithdrawalId,
    affiliate_id: &'a AffiliateId,
    amount_cents: Cents,
    method: PaymentMethod,
    details: Option<&'a PaymentDetails>,
}

#[derive(Deserialize)]
struct DisburseResponse {
    payout_ref: String,
    #[serde(default = "settled_default")]
    settled: bool,
}

fn settled_default() -> bool {
    true
}

/// Money-movement rail. One attempt per call.
pub struct HttpPayoutRail {
    client: JsonClient,
}

impl HttpPayoutRail {
    pub fn new(endpoint: &ServiceEndpoint) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(endpoint)?,
        })
    }
}

#[async_trait]
impl PayoutRail for HttpPayoutRail {
    async fn disburse(
        &self,
        withdrawal_id: WithdrawalId,
        affiliate_id: &AffiliateId,
        amount: Cents,
        method: PaymentMethod,
        details: Option<&PaymentDetails>,
    ) -> Result<PayoutReceipt> {
        let response: DisburseResponse = self
            .client
            .post(
                "/payouts",
                &DisburseRequest {
                    withdrawal_id,
                    affiliate_id,
                    amount_cents: amount,
                    method,
                    details,
                },
            )
            .await?;
        Ok(PayoutReceipt {
            payout_ref: response.payout_ref,
            settled: response.settled,
        })
    }
}

#[derive(Deserialize)]
struct KycResponse {
    verified: bool,
}

/// Identity verification provider.
pub struct HttpKycVerifier {
    client: JsonClient,
}

impl HttpKycVerifier {
    pub fn new(endpoint: &ServiceEndpoint) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(endpoint)?,
        })
    }
}

#[async_trait]
impl KycVerifier for HttpKycVerifier {
    async fn is_verified(&self, affiliate_id: &AffiliateId) -> Result<bool> {
        let path = format!("/kyc/{affiliate_id}");
        let response: KycResponse = (|| async { self.client.get(&path).await })
            .retry(http_backoff())
            .when(ClientError::is_transient)
            .await?;
        Ok(response.verified)
    }
}
