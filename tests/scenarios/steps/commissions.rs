//! Commission idempotence and refund step definitions.

use chrono::{Duration, Months};
use cucumber::{then, when};
use futures::future::join_all;

use commission_ledger::ledger::{CreditRequest, RefundOutcome};
use commission_ledger::model::{AffiliateId, CommissionKind, CommissionStatus};

use super::LedgerWorld;

#[when(expr = "event {string} crediting {string} with {int} cents arrives {int} times concurrently")]
async fn when_duplicate_credits(
    world: &mut LedgerWorld,
    source: String,
    name: String,
    cents: i64,
    times: usize,
) {
    let ledger = world.app().ledger().clone();
    let now = world.now();
    let tasks = (0..times).map(|_| {
        let ledger = ledger.clone();
        let req = CreditRequest::new(
            source.clone(),
            AffiliateId::new(&name),
            CommissionKind::DirectCall,
            cents,
            "USD",
            now,
        );
        tokio::spawn(async move { ledger.credit(req).await })
    });

    let created = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .filter(|outcome| outcome.created)
        .count();
    assert_eq!(created, 1, "exactly one delivery creates the commission");
}

#[then(expr = "the commission for call {string} is {word}")]
async fn then_commission_status(world: &mut LedgerWorld, call_id: String, status: String) {
    let commission = world
        .app()
        .ledger()
        .commissions_of(
            &world
                .call(&call_id)
                .direct
                .as_ref()
                .expect("call credited someone")
                .commission
                .affiliate_id,
        )
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.source_event_id == call_id)
        .expect("commission recorded");
    let expected = match status.as_str() {
        "pending" => CommissionStatus::Pending,
        "validated" => CommissionStatus::Validated,
        "payable" => CommissionStatus::Payable,
        "paid" => CommissionStatus::Paid,
        "cancelled" => CommissionStatus::Cancelled,
        "clawed_back" => CommissionStatus::ClawedBack,
        other => panic!("Unknown status {other}"),
    };
    assert_eq!(commission.status, expected);
}

/// Refund `call_id` at `months` months plus `days` days after it was paid.
async fn refund_after_payment(world: &mut LedgerWorld, call_id: &str, months: u32, days: i64) -> RefundOutcome {
    let affiliate = world
        .call(call_id)
        .direct
        .as_ref()
        .expect("call credited someone")
        .commission
        .affiliate_id
        .clone();
    let paid_at = world
        .app()
        .ledger()
        .commissions_of(&affiliate)
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.source_event_id == call_id)
        .and_then(|c| c.paid_at)
        .expect("commission paid");

    let at = paid_at
        .checked_add_months(Months::new(months))
        .expect("date in range")
        + Duration::days(days);
    let effects = world
        .app()
        .ingress()
        .refund_issued(&format!("refund-{call_id}"), call_id, at)
        .await
        .unwrap();
    assert_eq!(effects.len(), 1);
    effects[0].outcome
}

#[when(expr = "call {string} is refunded")]
async fn when_refunded(world: &mut LedgerWorld, call_id: String) {
    let now = world.now();
    world
        .app()
        .ingress()
        .refund_issued(&format!("refund-{call_id}"), &call_id, now)
        .await
        .unwrap();
}

#[then(expr = "a refund of call {string} exactly {int} months after payment claws it back")]
async fn then_refund_at_boundary(world: &mut LedgerWorld, call_id: String, months: u32) {
    let outcome = refund_after_payment(world, &call_id, months, 0).await;
    assert_eq!(outcome, RefundOutcome::ClawedBack);
}

#[then(expr = "a refund of call {string} {int} months and {int} day after payment has no effect")]
async fn then_refund_past_boundary(world: &mut LedgerWorld, call_id: String, months: u32, days: i64) {
    let outcome = refund_after_payment(world, &call_id, months, days).await;
    assert_eq!(outcome, RefundOutcome::ClawbackWindowExpired);
}

#[then(expr = "{string} owes {int} cents of clawback")]
async fn then_outstanding_clawback(world: &mut LedgerWorld, name: String, cents: i64) {
    let balance = world
        .app()
        .ledger()
        .balance_of(&AffiliateId::new(&name))
        .await
        .unwrap();
    assert_eq!(balance.outstanding_clawback, cents);
}
