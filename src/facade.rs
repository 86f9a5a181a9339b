//! Ledger facade for in-process library usage.
//!
//! Wires every component over one event store so callers get a single
//! handle instead of assembling the graph, tracker, gate, ledger, workflow
//! and read models by hand.
//!
//! # Example
//!
//! ```ignore
//! use commission_ledger::config::Config;
//! use commission_ledger::facade::AffiliateLedger;
//!
//! let ledger = AffiliateLedger::builder(Config::for_test()).build().await?;
//! ledger.ingress().record_click("visitor-1", "alice-code", now, None).await?;
//! let summary = ledger.dashboard().summary(&alice, now).await?;
//! ```

use std::sync::Arc;

use tracing::info;

use crate::attribution::AttributionTracker;
use crate::clients::ExternalClients;
use crate::config::{Config, ConfigError};
use crate::fraud::FraudGate;
use crate::interfaces::event_store::{EventStore, StorageError};
use crate::interfaces::external::ClientError;
use crate::leaderboard::LeaderboardAggregator;
use crate::ledger::CommissionLedger;
use crate::referral::ReferralGraph;
use crate::repository::Repository;
use crate::services::{DashboardService, IngressService, Scheduler};
use crate::storage::init_storage;
use crate::utils::retry::conflict_backoff;
use crate::withdrawal::WithdrawalWorkflow;

/// Errors from assembling the ledger.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Builder for [`AffiliateLedger`].
pub struct AffiliateLedgerBuilder {
    config: Config,
    store: Option<Arc<dyn EventStore>>,
    clients: Option<ExternalClients>,
}

impl AffiliateLedgerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            clients: None,
        }
    }

    /// Use an existing event store instead of the configured backend.
    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use these collaborators instead of the configured endpoints.
    pub fn with_clients(mut self, clients: ExternalClients) -> Self {
        self.clients = Some(clients);
        self
    }

    pub async fn build(self) -> Result<AffiliateLedger, FacadeError> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => init_storage(&config.storage).await?,
        };
        let clients = match self.clients {
            Some(clients) => clients,
            None => ExternalClients::from_config(&config.clients)?,
        };

        let repo = Repository::new(store.clone(), conflict_backoff(&config.ledger.retry));
        let graph = Arc::new(ReferralGraph::new(
            repo.clone(),
            config.ledger.referral_window_months,
        ));
        let attribution = Arc::new(AttributionTracker::new(
            repo.clone(),
            config.attribution.cookie_days,
        ));
        let fraud = Arc::new(FraudGate::new(
            repo.clone(),
            graph.clone(),
            config.fraud.clone(),
        ));
        let ledger = Arc::new(CommissionLedger::new(
            repo.clone(),
            graph.clone(),
            attribution.clone(),
            fraud.clone(),
            config.ledger.clone(),
            config.programs.clone(),
        ));
        let withdrawals = Arc::new(WithdrawalWorkflow::new(
            repo,
            ledger.clone(),
            clients.confirmation,
            clients.payout,
            clients.kyc,
            config.withdrawal.clone(),
        ));
        let leaderboard = Arc::new(LeaderboardAggregator::new(
            ledger.clone(),
            graph.clone(),
            config.leaderboard.clone(),
        ));

        let ingress = Arc::new(IngressService::new(
            ledger.clone(),
            graph.clone(),
            attribution.clone(),
            fraud.clone(),
            withdrawals.clone(),
        ));
        let dashboard = Arc::new(DashboardService::new(
            ledger.clone(),
            withdrawals.clone(),
            leaderboard.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            ledger.clone(),
            withdrawals.clone(),
            config.scheduler.clone(),
        ));

        info!(
            settlement_policy = ?config.ledger.settlement_policy,
            currency = %config.ledger.currency,
            "Affiliate ledger ready"
        );

        Ok(AffiliateLedger {
            config,
            store,
            graph,
            attribution,
            fraud,
            ledger,
            withdrawals,
            leaderboard,
            ingress,
            dashboard,
            scheduler,
        })
    }
}

/// Every ledger component over one event store.
pub struct AffiliateLedger {
    config: Config,
    store: Arc<dyn EventStore>,
    graph: Arc<ReferralGraph>,
    attribution: Arc<AttributionTracker>,
    fraud: Arc<FraudGate>,
    ledger: Arc<CommissionLedger>,
    withdrawals: Arc<WithdrawalWorkflow>,
    leaderboard: Arc<LeaderboardAggregator>,
    ingress: Arc<IngressService>,
    dashboard: Arc<DashboardService>,
    scheduler: Arc<Scheduler>,
}

impl AffiliateLedger {
    pub fn builder(config: Config) -> AffiliateLedgerBuilder {
        AffiliateLedgerBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn graph(&self) -> &Arc<ReferralGraph> {
        &self.graph
    }

    pub fn attribution(&self) -> &Arc<AttributionTracker> {
        &self.attribution
    }

    pub fn fraud(&self) -> &Arc<FraudGate> {
        &self.fraud
    }

    pub fn ledger(&self) -> &Arc<CommissionLedger> {
        &self.ledger
    }

    pub fn withdrawals(&self) -> &Arc<WithdrawalWorkflow> {
        &self.withdrawals
    }

    pub fn leaderboard(&self) -> &Arc<LeaderboardAggregator> {
        &self.leaderboard
    }

    pub fn ingress(&self) -> &Arc<IngressService> {
        &self.ingress
    }

    pub fn dashboard(&self) -> &Arc<DashboardService> {
        &self.dashboard
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}
