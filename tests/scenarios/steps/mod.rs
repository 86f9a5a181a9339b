//! Shared world and common step definitions.

pub mod attribution;
pub mod commissions;
pub mod recruitment;
pub mod withdrawals;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Months, TimeZone, Utc};
use cucumber::{given, then, when, World};

use commission_ledger::clients::mock::{MockConfirmationChannel, MockKycVerifier, MockPayoutRail};
use commission_ledger::clients::ExternalClients;
use commission_ledger::config::Config;
use commission_ledger::ledger::CreditRequest;
use commission_ledger::model::{
    AffiliateId, CommissionEvent, CommissionKind, PaymentDetails, ProgramType,
};
use commission_ledger::services::CallOutcome;
use commission_ledger::AffiliateLedger;

/// Test context for ledger scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct LedgerWorld {
    app: Option<AffiliateLedger>,
    channel: Arc<MockConfirmationChannel>,
    rail: Arc<MockPayoutRail>,
    kyc: Arc<MockKycVerifier>,
    now: DateTime<Utc>,
    calls: HashMap<String, CallOutcome>,
    seeded: usize,
}

impl fmt::Debug for LedgerWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerWorld")
            .field("now", &self.now)
            .field("calls", &self.calls.len())
            .finish_non_exhaustive()
    }
}

impl LedgerWorld {
    fn new() -> Self {
        Self {
            app: None,
            channel: Arc::new(MockConfirmationChannel::new()),
            rail: Arc::new(MockPayoutRail::new()),
            kyc: Arc::new(MockKycVerifier::new()),
            now: Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap(),
            calls: HashMap::new(),
            seeded: 0,
        }
    }

    pub fn app(&self) -> &AffiliateLedger {
        self.app.as_ref().expect("Ledger not initialized")
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn channel(&self) -> &MockConfirmationChannel {
        &self.channel
    }

    pub fn rail(&self) -> &MockPayoutRail {
        &self.rail
    }

    pub fn record_call(&mut self, call_id: String, outcome: CallOutcome) {
        self.calls.insert(call_id, outcome);
    }

    pub fn call(&self, call_id: &str) -> &CallOutcome {
        self.calls
            .get(call_id)
            .unwrap_or_else(|| panic!("No call {call_id} recorded"))
    }

    pub async fn commissions(&self, name: &str) -> Vec<CommissionEvent> {
        self.app()
            .ledger()
            .commissions_of(&AffiliateId::new(name))
            .await
            .unwrap()
    }

    /// Credit `amount` to `name`, then run validation and the payout
    /// release after the hold.
    pub async fn seed_payable(&mut self, name: &str, amount: i64) {
        self.seeded += 1;
        let ledger = self.app().ledger().clone();
        ledger
            .credit(CreditRequest::new(
                format!("seed-{name}-{}", self.seeded),
                AffiliateId::new(name),
                CommissionKind::DirectCall,
                amount,
                "USD",
                self.now,
            ))
            .await
            .unwrap();
        self.advance(Duration::days(i64::from(ledger.config().hold_days) + 1));
        ledger.validate_matured(self.now).await.unwrap();
        ledger.release_payable(self.now).await.unwrap();
    }
}

pub fn program(word: &str) -> ProgramType {
    match word {
        "group_admin" => ProgramType::GroupAdmin,
        "blogger" => ProgramType::Blogger,
        "chatter" => ProgramType::Chatter,
        other => panic!("Unknown program {other}"),
    }
}

pub fn kind(word: &str) -> CommissionKind {
    match word {
        "direct_call" => CommissionKind::DirectCall,
        "provider_recruit_call" => CommissionKind::ProviderRecruitCall,
        "admin_recruit_bonus" => CommissionKind::AdminRecruitBonus,
        other => panic!("Unknown commission kind {other}"),
    }
}

// --- Background ---

#[given("a fresh ledger")]
async fn given_fresh_ledger(world: &mut LedgerWorld) {
    let clients = ExternalClients {
        confirmation: world.channel.clone(),
        payout: world.rail.clone(),
        kyc: world.kyc.clone(),
    };
    let app = AffiliateLedger::builder(Config::for_test())
        .with_clients(clients)
        .build()
        .await
        .expect("Failed to build ledger");
    world.app = Some(app);
}

// --- Given steps ---

#[given(expr = "affiliate {string} in the {word} program")]
async fn given_affiliate(world: &mut LedgerWorld, name: String, program_word: String) {
    let id = AffiliateId::new(&name);
    let ledger = world.app().ledger().clone();
    let now = world.now;
    ledger
        .register_affiliate(
            &id,
            program(&program_word),
            &format!("{name}-code"),
            &format!("{name}-recruit"),
            now,
        )
        .await
        .unwrap();
    ledger
        .link_confirmation_channel(&id, &format!("@{name}"), now)
        .await
        .unwrap();
    ledger
        .update_payment_details(
            &id,
            PaymentDetails::Paypal {
                email: format!("{name}@example.com"),
            },
            now,
        )
        .await
        .unwrap();
    world.kyc.set_verified(&id, true).await;
}

#[given(expr = "{string} has earned {int} cents payable")]
async fn given_payable(world: &mut LedgerWorld, name: String, amount: i64) {
    world.seed_payable(&name, amount).await;
}

// --- When steps ---

#[when(expr = "{int} day(s) pass")]
#[given(expr = "{int} day(s) pass")]
async fn when_days_pass(world: &mut LedgerWorld, days: i64) {
    world.advance(Duration::days(days));
}

#[when(expr = "{int} minute(s) pass")]
async fn when_minutes_pass(world: &mut LedgerWorld, minutes: i64) {
    world.advance(Duration::minutes(minutes));
}

#[when(expr = "{int} month(s) pass")]
#[given(expr = "{int} month(s) pass")]
async fn when_months_pass(world: &mut LedgerWorld, months: u32) {
    world.now = world
        .now
        .checked_add_months(Months::new(months))
        .expect("date in range");
}

#[when("the scheduler runs")]
async fn when_scheduler_runs(world: &mut LedgerWorld) {
    let now = world.now;
    world.app().scheduler().tick(now).await;
}

// --- Then steps ---

#[then(expr = "{string} has {int} cents pending")]
async fn then_pending(world: &mut LedgerWorld, name: String, cents: i64) {
    let balance = world
        .app()
        .ledger()
        .balance_of(&AffiliateId::new(&name))
        .await
        .unwrap();
    assert_eq!(balance.pending, cents, "pending balance of {name}");
}

#[then(expr = "{string} has {int} cents available")]
async fn then_available(world: &mut LedgerWorld, name: String, cents: i64) {
    let balance = world
        .app()
        .ledger()
        .balance_of(&AffiliateId::new(&name))
        .await
        .unwrap();
    assert_eq!(balance.available, cents, "available balance of {name}");
}

#[then(expr = "{string} has {int} commission(s) of kind {word}")]
async fn then_commissions_of_kind(world: &mut LedgerWorld, name: String, count: usize, kind_word: String) {
    let wanted = kind(&kind_word);
    let found = world
        .commissions(&name)
        .await
        .iter()
        .filter(|c| c.kind == wanted)
        .count();
    assert_eq!(found, count, "{kind_word} commissions of {name}");
}

#[then(expr = "{string} has no commissions")]
async fn then_no_commissions(world: &mut LedgerWorld, name: String) {
    assert!(world.commissions(&name).await.is_empty());
}

#[then(expr = "the balance of {string} satisfies the balance formula")]
async fn then_balance_formula(world: &mut LedgerWorld, name: String) {
    let b = world
        .app()
        .ledger()
        .balance_of(&AffiliateId::new(&name))
        .await
        .unwrap();
    let raw = b.payable + b.paid - b.withdrawn - b.reserved;
    assert!(b.available >= 0);
    assert_eq!(b.available, raw.max(0));
    assert_eq!(b.outstanding_clawback, (-raw).max(0));
}
