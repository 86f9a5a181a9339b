//! Outbound HTTP endpoint configuration.

use serde::Deserialize;

/// HTTP endpoint for an external collaborator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoint {
    /// Base URL, e.g. `https://bot.internal:8443`.
    pub url: String,
    pub timeout_ms: u64,
    /// Sent as a bearer token when set.
    pub api_key: Option<String>,
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_ms: 5_000,
            api_key: None,
        }
    }
}

/// External collaborators. A missing endpoint selects the in-process fake.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    pub confirmation: Option<ServiceEndpoint>,
    pub payout: Option<ServiceEndpoint>,
    pub kyc: Option<ServiceEndpoint>,
}
