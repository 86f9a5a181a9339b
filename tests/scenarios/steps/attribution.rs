//! Click attribution and direct call step definitions.

use cucumber::{then, when};

use commission_ledger::ledger::Referrer;
use commission_ledger::model::AffiliateId;
use commission_ledger::services::CallCompleted;

use super::LedgerWorld;

#[when(expr = "visitor {string} clicks the link of {string}")]
async fn when_visitor_clicks(world: &mut LedgerWorld, visitor: String, name: String) {
    let now = world.now();
    world
        .app()
        .ingress()
        .record_click(&visitor, &format!("{name}-code"), now, None)
        .await
        .unwrap();
}

#[when(expr = "visitor {string} completes call {string}")]
async fn when_visitor_completes_call(world: &mut LedgerWorld, visitor: String, call_id: String) {
    let event = CallCompleted {
        source_event_id: call_id.clone(),
        referrer: Referrer::Visitor(visitor),
        amount: 4_900,
        client_id: None,
        provider_id: None,
        at: world.now(),
    };
    let outcome = world.app().ingress().call_completed(event).await.unwrap();
    world.record_call(call_id, outcome);
}

#[then(expr = "call {string} credits {string} with {int} cents")]
async fn then_call_credits(world: &mut LedgerWorld, call_id: String, name: String, cents: i64) {
    let direct = world
        .call(&call_id)
        .direct
        .as_ref()
        .unwrap_or_else(|| panic!("call {call_id} credited nobody"));
    assert_eq!(direct.commission.affiliate_id, AffiliateId::new(&name));
    assert_eq!(direct.commission.amount, cents);
}

#[then(expr = "call {string} credits nobody")]
async fn then_call_credits_nobody(world: &mut LedgerWorld, call_id: String) {
    assert!(world.call(&call_id).direct.is_none());
}
