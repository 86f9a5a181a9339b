//! ledgerd: affiliate commission ledger daemon
//!
//! Loads configuration, opens the event store, and runs the periodic
//! ledger jobs until interrupted.
//!
//! ## Configuration
//! ```yaml
//! storage:
//!   type: sqlite
//!   path: ./data/ledger.db
//!
//! ledger:
//!   hold_days: 14
//!   settlement_policy: on_request
//!
//! scheduler:
//!   tick_secs: 60
//!   payout_day: 1
//!
//! clients:
//!   confirmation:
//!     url: http://telegram-bot:8080
//!   payout:
//!     url: http://payouts:8080
//!     api_key: secret
//! ```
//!
//! `LEDGER_LOG` sets the log filter (default `info`).

use tracing::{error, info};

use commission_ledger::config::Config;
use commission_ledger::utils::bootstrap::{init_tracing, parse_config_path};
use commission_ledger::AffiliateLedger;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path(std::env::args().skip(1));
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let scheduler_enabled = config.scheduler.enabled;

    info!("Starting ledgerd");
    let app = AffiliateLedger::builder(config).build().await?;

    if !scheduler_enabled {
        info!("Scheduler disabled; nothing to run");
        return Ok(());
    }

    let scheduler = app.scheduler().clone();
    let jobs = tokio::spawn(async move { scheduler.run().await });

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    jobs.abort();
    Ok(())
}
