use std::time::Duration as StdDuration;

use backon::ExponentialBuilder;
use chrono::TimeZone;

use super::*;
use crate::attribution::AttributionTracker;
use crate::clients::mock::{MockConfirmationChannel, MockKycVerifier, MockPayoutRail};
use crate::config::{FraudConfig, LedgerConfig, ProgramsConfig};
use crate::fraud::FraudGate;
use crate::interfaces::event_store::EventStore;
use crate::ledger::CreditRequest;
use crate::model::{CommissionKind, CommissionStatus, PaymentDetails, ProgramType};
use crate::referral::ReferralGraph;
use crate::storage::MemoryEventStore;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 8, 0, 0).unwrap()
}

/// After the hold and the payout release.
fn payable_at() -> DateTime<Utc> {
    t0() + Duration::days(20)
}

struct Fixture {
    ledger: Arc<CommissionLedger>,
    workflow: Arc<WithdrawalWorkflow>,
    channel: Arc<MockConfirmationChannel>,
    rail: Arc<MockPayoutRail>,
    kyc: Arc<MockKycVerifier>,
}

fn fixture_with(ledger_config: LedgerConfig, programs: ProgramsConfig) -> Fixture {
    fixture_on(Arc::new(MemoryEventStore::new()), ledger_config, programs)
}

fn fixture_on(
    store: Arc<dyn EventStore>,
    ledger_config: LedgerConfig,
    programs: ProgramsConfig,
) -> Fixture {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(StdDuration::from_millis(1))
        .with_max_delay(StdDuration::from_millis(10))
        .with_max_times(500)
        .with_jitter();
    let repo = Repository::new(store, backoff);
    let graph = Arc::new(ReferralGraph::new(repo.clone(), 12));
    let attribution = Arc::new(AttributionTracker::new(repo.clone(), 30));
    let fraud = Arc::new(FraudGate::new(repo.clone(), graph.clone(), FraudConfig::default()));
    let ledger = Arc::new(CommissionLedger::new(
        repo.clone(),
        graph,
        attribution,
        fraud,
        ledger_config,
        programs,
    ));
    let channel = Arc::new(MockConfirmationChannel::new());
    let rail = Arc::new(MockPayoutRail::new());
    let kyc = Arc::new(MockKycVerifier::new());
    let config = WithdrawalConfig {
        rail_min_delay_ms: 1,
        rail_max_delay_ms: 2,
        ..WithdrawalConfig::default()
    };
    let workflow = Arc::new(WithdrawalWorkflow::new(
        repo,
        ledger.clone(),
        channel.clone(),
        rail.clone(),
        kyc.clone(),
        config,
    ));
    Fixture {
        ledger,
        workflow,
        channel,
        rail,
        kyc,
    }
}

fn fixture() -> Fixture {
    fixture_with(LedgerConfig::default(), ProgramsConfig::default())
}

/// Registered, KYC-verified, Telegram-linked affiliate with `payable` cents.
async fn funded(fx: &Fixture, name: &str, payable: Cents) -> AffiliateId {
    let affiliate = AffiliateId::new(name);
    fx.ledger
        .register_affiliate(
            &affiliate,
            ProgramType::GroupAdmin,
            &format!("{name}-c"),
            &format!("{name}-r"),
            t0(),
        )
        .await
        .unwrap();
    fx.ledger
        .link_confirmation_channel(&affiliate, &format!("@{name}"), t0())
        .await
        .unwrap();
    fx.ledger
        .update_payment_details(
            &affiliate,
            PaymentDetails::Paypal {
                email: format!("{name}@example.com"),
            },
            t0(),
        )
        .await
        .unwrap();
    fx.kyc.set_verified(&affiliate, true).await;

    fx.ledger
        .credit(CreditRequest::new(
            format!("{name}-seed"),
            affiliate.clone(),
            CommissionKind::DirectCall,
            payable,
            "USD",
            t0(),
        ))
        .await
        .unwrap();
    fx.ledger.validate_matured(t0() + Duration::days(14)).await.unwrap();
    fx.ledger.release_payable(payable_at()).await.unwrap();
    affiliate
}

#[tokio::test]
async fn test_confirmed_withdrawal_pays_commissions() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    let now = payable_at();

    let w = fx
        .workflow
        .request(&alice, 8_000, PaymentMethod::Paypal, now)
        .await
        .unwrap();
    assert_eq!(w.status, WithdrawalStatus::PendingConfirmation);
    assert_eq!(fx.ledger.balance_of(&alice).await.unwrap().available, 2_000);

    let reference = fx.channel.ref_for(w.id).await.unwrap();
    let w = fx
        .workflow
        .confirmed_by_ref(&reference, now + Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(w.status, WithdrawalStatus::Approved);

    let w = fx.workflow.process(w.id, now + Duration::minutes(3)).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Completed);
    assert_eq!(w.payout_ref.as_deref(), Some(format!("payout-{}", w.id).as_str()));
    assert_eq!(w.covered_commissions.len(), 1);

    let balance = fx.ledger.balance_of(&alice).await.unwrap();
    assert_eq!(balance.paid, 10_000);
    assert_eq!(balance.withdrawn, 8_000);
    assert_eq!(balance.available, 2_000);
    let commissions = fx.ledger.commissions_of(&alice).await.unwrap();
    assert_eq!(commissions[0].status, CommissionStatus::Paid);
    assert_eq!(commissions[0].withdrawal_id, Some(w.id));
}

#[tokio::test]
async fn test_request_validation_errors() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    let now = payable_at();

    assert!(matches!(
        fx.workflow.request(&alice, 2_000, PaymentMethod::Paypal, now).await,
        Err(WithdrawalError::BelowWithdrawalThreshold { minimum: 2_500, .. })
    ));
    assert!(matches!(
        fx.workflow.request(&alice, 12_000, PaymentMethod::Paypal, now).await,
        Err(WithdrawalError::InsufficientBalance { available: 10_000, .. })
    ));

    let first = fx
        .workflow
        .request(&alice, 3_000, PaymentMethod::Paypal, now)
        .await
        .unwrap();
    assert!(matches!(
        fx.workflow.request(&alice, 3_000, PaymentMethod::Paypal, now).await,
        Err(WithdrawalError::PendingWithdrawalExists(id)) if id == first.id
    ));
}

#[tokio::test]
async fn test_kyc_required_then_cached() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    fx.kyc.set_verified(&alice, false).await;

    assert!(matches!(
        fx.workflow
            .request(&alice, 3_000, PaymentMethod::Paypal, payable_at())
            .await,
        Err(WithdrawalError::KycRequired)
    ));

    fx.kyc.set_verified(&alice, true).await;
    fx.workflow
        .request(&alice, 3_000, PaymentMethod::Paypal, payable_at())
        .await
        .unwrap();
    let account = fx.ledger.account(&alice).await.unwrap().unwrap();
    assert_eq!(account.kyc, KycStatus::Verified);
}

#[tokio::test]
async fn test_confirmation_requires_linked_channel() {
    let fx = fixture();
    let bob = AffiliateId::new("bob");
    fx.ledger
        .register_affiliate(&bob, ProgramType::Blogger, "bob-c", "bob-r", t0())
        .await
        .unwrap();
    fx.kyc.set_verified(&bob, true).await;
    fx.ledger
        .credit(CreditRequest::new("bob-seed", bob.clone(), CommissionKind::DirectCall, 5_000, "USD", t0()))
        .await
        .unwrap();
    fx.ledger.validate_matured(t0() + Duration::days(14)).await.unwrap();
    fx.ledger.release_payable(payable_at()).await.unwrap();

    assert!(matches!(
        fx.workflow
            .request(&bob, 3_000, PaymentMethod::Wise, payable_at())
            .await,
        Err(WithdrawalError::TelegramRequired)
    ));
    assert!(fx.workflow.withdrawals_of(&bob).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_channel_failure_releases_reservation() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    fx.channel.set_fail_on_request(true).await;

    let err = fx
        .workflow
        .request(&alice, 5_000, PaymentMethod::Paypal, payable_at())
        .await
        .unwrap_err();
    assert!(matches!(err, WithdrawalError::ConfirmationChannelUnavailable(_)));

    let withdrawals = fx.workflow.withdrawals_of(&alice).await.unwrap();
    assert_eq!(withdrawals.len(), 1);
    assert_eq!(withdrawals[0].status, WithdrawalStatus::Cancelled);
    assert_eq!(fx.ledger.balance_of(&alice).await.unwrap().available, 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_reserve_once() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let workflow = fx.workflow.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                workflow
                    .request(&alice, 8_000, PaymentMethod::Paypal, payable_at())
                    .await
            })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|task| task.unwrap())
        .collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(WithdrawalError::PendingWithdrawalExists(_))
            | Err(WithdrawalError::InsufficientBalance { .. })
    )));

    let balance = fx.ledger.balance_of(&alice).await.unwrap();
    assert_eq!(balance.reserved, 8_000);
    assert_eq!(balance.available, 2_000);
}

#[tokio::test]
async fn test_unconfirmed_withdrawal_expires() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    let now = payable_at();

    let w = fx
        .workflow
        .request(&alice, 5_000, PaymentMethod::Paypal, now)
        .await
        .unwrap();
    assert_eq!(fx.workflow.expire_stale(now + Duration::minutes(9)).await.unwrap(), 0);
    assert_eq!(fx.workflow.expire_stale(now + Duration::minutes(10)).await.unwrap(), 1);
    // Idempotent
    assert_eq!(fx.workflow.expire_stale(now + Duration::minutes(11)).await.unwrap(), 0);

    let expired = fx.workflow.withdrawal(w.id).await.unwrap();
    assert_eq!(expired.status, WithdrawalStatus::Expired);
    assert_eq!(fx.ledger.balance_of(&alice).await.unwrap().available, 10_000);

    let reference = fx.channel.ref_for(w.id).await.unwrap();
    assert!(matches!(
        fx.workflow.confirm(w.id, &reference, now + Duration::minutes(12)).await,
        Err(WithdrawalError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_late_confirmation_expires() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    let now = payable_at();

    let w = fx
        .workflow
        .request(&alice, 5_000, PaymentMethod::Paypal, now)
        .await
        .unwrap();
    let reference = fx.channel.ref_for(w.id).await.unwrap();

    assert!(matches!(
        fx.workflow.confirm(w.id, "wrong", now).await,
        Err(WithdrawalError::ConfirmationMismatch(_))
    ));
    assert!(matches!(
        fx.workflow.confirm(w.id, &reference, now + Duration::minutes(11)).await,
        Err(WithdrawalError::ConfirmationExpired(_))
    ));
    assert_eq!(
        fx.workflow.withdrawal(w.id).await.unwrap().status,
        WithdrawalStatus::Expired
    );
}

#[tokio::test]
async fn test_cancel_by_ref_releases() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    let w = fx
        .workflow
        .request(&alice, 5_000, PaymentMethod::Paypal, payable_at())
        .await
        .unwrap();
    let reference = fx.channel.ref_for(w.id).await.unwrap();

    let cancelled = fx
        .workflow
        .cancelled_by_ref(&reference, payable_at())
        .await
        .unwrap();
    assert_eq!(cancelled.status, WithdrawalStatus::Cancelled);
    assert_eq!(fx.ledger.balance_of(&alice).await.unwrap().available, 10_000);

    assert!(matches!(
        fx.workflow.confirmed_by_ref("nope", payable_at()).await,
        Err(WithdrawalError::UnknownConfirmationRef(_))
    ));
}

#[tokio::test]
async fn test_rail_retries_transient_failures() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    fx.rail.set_transient_failures(2).await;

    let w = fx
        .workflow
        .request(&alice, 5_000, PaymentMethod::Paypal, payable_at())
        .await
        .unwrap();
    let reference = fx.channel.ref_for(w.id).await.unwrap();
    fx.workflow.confirm(w.id, &reference, payable_at()).await.unwrap();

    let w = fx.workflow.process(w.id, payable_at()).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Completed);
    assert_eq!(fx.rail.calls(), 3);
}

#[tokio::test]
async fn test_rail_failure_fails_withdrawal() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    fx.rail.set_transient_failures(10).await;

    let w = fx
        .workflow
        .request(&alice, 5_000, PaymentMethod::Paypal, payable_at())
        .await
        .unwrap();
    let reference = fx.channel.ref_for(w.id).await.unwrap();
    fx.workflow.confirm(w.id, &reference, payable_at()).await.unwrap();

    let err = fx.workflow.process(w.id, payable_at()).await.unwrap_err();
    assert!(matches!(err, WithdrawalError::ExternalRailFailure { .. }));
    assert_eq!(fx.rail.calls(), 3);

    assert_eq!(
        fx.workflow.withdrawal(w.id).await.unwrap().status,
        WithdrawalStatus::Failed
    );
    let balance = fx.ledger.balance_of(&alice).await.unwrap();
    assert_eq!(balance.payable, 10_000);
    assert_eq!(balance.available, 10_000);
}

#[tokio::test]
async fn test_manual_approval_and_rejection() {
    let mut programs = ProgramsConfig::default();
    programs.group_admin.manual_approval = true;
    let fx = fixture_with(LedgerConfig::default(), programs);
    let alice = funded(&fx, "alice", 10_000).await;

    let w = fx
        .workflow
        .request(&alice, 4_000, PaymentMethod::Paypal, payable_at())
        .await
        .unwrap();
    let reference = fx.channel.ref_for(w.id).await.unwrap();
    let w = fx.workflow.confirm(w.id, &reference, payable_at()).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Confirmed);
    assert!(matches!(
        fx.workflow.process(w.id, payable_at()).await,
        Err(WithdrawalError::InvalidTransition { .. })
    ));

    let w = fx.workflow.approve(w.id, "ops", payable_at()).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Approved);

    let w = fx.workflow.reject(w.id, "suspicious", payable_at()).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Rejected);
    assert_eq!(w.reason.as_deref(), Some("suspicious"));
    assert_eq!(fx.ledger.balance_of(&alice).await.unwrap().available, 10_000);
}

#[tokio::test]
async fn test_automatic_payouts_drain_available_balance() {
    let ledger_config = LedgerConfig {
        settlement_policy: SettlementPolicy::Automatic,
        ..LedgerConfig::default()
    };
    let fx = fixture_with(ledger_config, ProgramsConfig::default());
    let alice = funded(&fx, "alice", 10_000).await;
    let small = funded(&fx, "small", 1_000).await;

    let paid = fx.workflow.run_automatic_payouts(payable_at()).await.unwrap();
    assert_eq!(paid, 1);

    let balance = fx.ledger.balance_of(&alice).await.unwrap();
    assert_eq!(balance.paid, 10_000);
    assert_eq!(balance.withdrawn, 10_000);
    assert_eq!(balance.available, 0);
    assert!(fx.workflow.withdrawals_of(&small).await.unwrap().is_empty());
    assert!(fx.channel.prompts().await.is_empty());
}

#[tokio::test]
async fn test_on_request_policy_skips_automatic_payouts() {
    let fx = fixture();
    funded(&fx, "alice", 10_000).await;
    assert_eq!(fx.workflow.run_automatic_payouts(payable_at()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_disabled_withdrawals_refused() {
    let fx = fixture();
    let alice = funded(&fx, "alice", 10_000).await;
    let workflow = WithdrawalWorkflow::new(
        fx.workflow.repo.clone(),
        fx.ledger.clone(),
        fx.channel.clone(),
        fx.rail.clone(),
        fx.kyc.clone(),
        WithdrawalConfig {
            enabled: false,
            ..WithdrawalConfig::default()
        },
    );
    assert!(matches!(
        workflow.request(&alice, 5_000, PaymentMethod::Paypal, payable_at()).await,
        Err(WithdrawalError::WithdrawalsDisabled)
    ));
}

#[tokio::test]
async fn test_read_failure_before_payout_leaves_withdrawal_approved() {
    let store = Arc::new(MemoryEventStore::new());
    let fx = fixture_on(store.clone(), LedgerConfig::default(), ProgramsConfig::default());
    let alice = funded(&fx, "alice", 10_000).await;

    let w = fx
        .workflow
        .request(&alice, 5_000, PaymentMethod::Paypal, payable_at())
        .await
        .unwrap();
    let reference = fx.channel.ref_for(w.id).await.unwrap();
    fx.workflow.confirm(w.id, &reference, payable_at()).await.unwrap();

    store.set_fail_on_read(true).await;
    let err = fx.workflow.process(w.id, payable_at()).await.unwrap_err();
    assert!(
        matches!(
            err,
            WithdrawalError::Storage(_) | WithdrawalError::Ledger(LedgerError::Storage(_))
        ),
        "unexpected error: {err}"
    );
    store.set_fail_on_read(false).await;

    assert_eq!(fx.rail.calls(), 0);
    assert_eq!(
        fx.workflow.withdrawal(w.id).await.unwrap().status,
        WithdrawalStatus::Approved
    );

    let w = fx.workflow.process(w.id, payable_at()).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Completed);
    assert_eq!(fx.ledger.balance_of(&alice).await.unwrap().available, 5_000);
}

