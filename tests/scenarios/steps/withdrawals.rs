//! Withdrawal workflow step definitions.

use cucumber::{then, when};

use commission_ledger::model::{AffiliateId, PaymentMethod, WithdrawalRequest};
use commission_ledger::withdrawal::WithdrawalError;

use super::LedgerWorld;

async fn last_withdrawal(world: &LedgerWorld, name: &str) -> WithdrawalRequest {
    world
        .app()
        .withdrawals()
        .withdrawals_of(&AffiliateId::new(name))
        .await
        .unwrap()
        .pop()
        .unwrap_or_else(|| panic!("{name} has no withdrawals"))
}

#[when(expr = "{string} requests a withdrawal of {int} cents")]
async fn when_requests_withdrawal(world: &mut LedgerWorld, name: String, cents: i64) {
    let now = world.now();
    world
        .app()
        .dashboard()
        .request_withdrawal(&AffiliateId::new(&name), cents, PaymentMethod::Paypal, now)
        .await
        .unwrap();
}

#[when(expr = "{string} requests two withdrawals of {int} cents concurrently")]
async fn when_requests_two(world: &mut LedgerWorld, name: String, cents: i64) {
    let workflow = world.app().withdrawals().clone();
    let now = world.now();
    let id = AffiliateId::new(&name);

    let (a, b) = tokio::join!(
        {
            let workflow = workflow.clone();
            let id = id.clone();
            tokio::spawn(async move { workflow.request(&id, cents, PaymentMethod::Paypal, now).await })
        },
        {
            let workflow = workflow.clone();
            let id = id.clone();
            tokio::spawn(async move { workflow.request(&id, cents, PaymentMethod::Paypal, now).await })
        }
    );
    let results = [a.unwrap(), b.unwrap()];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1, "exactly one request reserves the balance");
    for result in results {
        if let Err(e) = result {
            assert!(
                matches!(
                    e,
                    WithdrawalError::InsufficientBalance { .. } | WithdrawalError::PendingWithdrawalExists(_)
                ),
                "unexpected error: {e}"
            );
        }
    }
}

#[when(expr = "{string} confirms the withdrawal")]
async fn when_confirms(world: &mut LedgerWorld, name: String) {
    let withdrawal = last_withdrawal(world, &name).await;
    let reference = world
        .channel()
        .ref_for(withdrawal.id)
        .await
        .expect("confirmation prompt sent");
    let now = world.now();
    world.app().ingress().confirmed(&reference, now).await.unwrap();
}

#[when(expr = "{string} declines the withdrawal")]
async fn when_declines(world: &mut LedgerWorld, name: String) {
    let withdrawal = last_withdrawal(world, &name).await;
    let reference = world
        .channel()
        .ref_for(withdrawal.id)
        .await
        .expect("confirmation prompt sent");
    let now = world.now();
    world.app().ingress().cancelled(&reference, now).await.unwrap();
}

#[when(expr = "the withdrawal of {string} is processed")]
async fn when_processed(world: &mut LedgerWorld, name: String) {
    let withdrawal = last_withdrawal(world, &name).await;
    let now = world.now();
    world
        .app()
        .withdrawals()
        .process(withdrawal.id, now)
        .await
        .unwrap();
}

#[when(expr = "{string} is paid out {int} cents")]
async fn when_paid_out(world: &mut LedgerWorld, name: String, cents: i64) {
    when_requests_withdrawal(world, name.clone(), cents).await;
    when_confirms(world, name.clone()).await;
    when_processed(world, name).await;
}

#[then(expr = "the withdrawal of {string} is {word}")]
async fn then_withdrawal_status(world: &mut LedgerWorld, name: String, status: String) {
    let withdrawal = last_withdrawal(world, &name).await;
    assert_eq!(withdrawal.status.as_str(), status);
}

#[then(expr = "{string} has no active withdrawal")]
async fn then_no_active(world: &mut LedgerWorld, name: String) {
    let withdrawal = last_withdrawal(world, &name).await;
    assert!(!withdrawal.status.is_active());
}

#[then(expr = "the payout rail was called {int} time(s)")]
async fn then_rail_calls(world: &mut LedgerWorld, calls: usize) {
    assert_eq!(world.rail().calls(), calls);
}
