//! Referral graph, recruitment commission, and bonus step definitions.

use cucumber::{given, then, when};
use futures::future::join_all;

use commission_ledger::ledger::Referrer;
use commission_ledger::model::{AffiliateId, Tier};
use commission_ledger::referral::GraphError;
use commission_ledger::services::{CallCompleted, IngressError, RecruitRegistered};

use super::LedgerWorld;

#[given(expr = "{string} recruited {string}")]
async fn given_recruited(world: &mut LedgerWorld, parent: String, child: String) {
    let event = RecruitRegistered {
        parent_code: format!("{parent}-recruit"),
        child_id: AffiliateId::new(&child),
        tier: Tier::N1,
        at: world.now(),
        fingerprint: None,
    };
    world.app().ingress().recruit_registered(event).await.unwrap();
}

#[when(expr = "provider {string} completes call {string}")]
async fn when_provider_completes_call(world: &mut LedgerWorld, provider: String, call_id: String) {
    let event = CallCompleted {
        source_event_id: call_id.clone(),
        referrer: Referrer::Visitor(format!("anonymous-{call_id}")),
        amount: 4_900,
        client_id: None,
        provider_id: Some(AffiliateId::new(&provider)),
        at: world.now(),
    };
    let outcome = world.app().ingress().call_completed(event).await.unwrap();
    world.record_call(call_id, outcome);
}

#[when(expr = "the recruitment bonus check for {string} runs {int} times concurrently")]
async fn when_bonus_checks_race(world: &mut LedgerWorld, child: String, times: usize) {
    let ledger = world.app().ledger().clone();
    let child = AffiliateId::new(&child);
    let now = world.now();

    let tasks = (0..times).map(|_| {
        let ledger = ledger.clone();
        let child = child.clone();
        tokio::spawn(async move { ledger.check_recruitment_bonus(&child, now).await })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }
}

#[then(expr = "{string} cannot recruit {string}")]
async fn then_cycle_rejected(world: &mut LedgerWorld, parent: String, child: String) {
    let event = RecruitRegistered {
        parent_code: format!("{parent}-recruit"),
        child_id: AffiliateId::new(&child),
        tier: Tier::N1,
        at: world.now(),
        fingerprint: None,
    };
    let err = world
        .app()
        .ingress()
        .recruit_registered(event)
        .await
        .expect_err("edge should be rejected");
    assert!(
        matches!(err, IngressError::Graph(GraphError::CycleDetected { .. })),
        "unexpected error: {err}"
    );
}

#[then(expr = "{string} is the {word} recruiter of {string}")]
async fn then_recruiter_of(world: &mut LedgerWorld, parent: String, tier: String, child: String) {
    let edge = world
        .app()
        .graph()
        .edge(&AffiliateId::new(&parent), &AffiliateId::new(&child))
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("no edge {parent} -> {child}"));
    assert_eq!(edge.tier.to_string(), tier);
}
