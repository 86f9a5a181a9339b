//! End-to-end ledger scenarios using Cucumber.
//!
//! Each scenario builds a fresh in-memory ledger through the facade, with
//! in-process fakes standing in for the confirmation channel, payout rail,
//! and KYC provider.
//!
//! ```bash
//! cargo test --test scenarios
//! ```

mod steps;

use cucumber::World;
use steps::LedgerWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running Ledger Scenarios ===\n");
    LedgerWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/scenarios/features")
        .await;
}
