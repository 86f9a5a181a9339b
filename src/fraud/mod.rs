//! Fraud heuristics consulted before a commission is created or advanced.
//!
//! The gate reads the referral graph and the caller-supplied context; it never
//! writes commission state. Its only writes are device observations in its
//! own streams.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::FraudConfig;
use crate::events::LedgerEvent;
use crate::interfaces::event_store::{EventPage, NewEvent};
use crate::model::{stream_root, AffiliateId, AttributionCookie, CommissionKind};
use crate::referral::{GraphError, ReferralGraph};
use crate::repository::{Aggregate, Decision, Repository};

/// Screening outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clear,
    /// Allowed into `pending`, held from validation until reviewed.
    Flagged(String),
    /// Creation refused.
    Blocked(String),
}

impl Verdict {
    fn severity(&self) -> u8 {
        match self {
            Verdict::Clear => 0,
            Verdict::Flagged(_) => 1,
            Verdict::Blocked(_) => 2,
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, Verdict::Clear)
    }
}

/// Everything the gate needs to judge one credit.
#[derive(Debug, Clone)]
pub struct ScreenContext {
    /// Affiliate receiving the commission.
    pub affiliate_id: AffiliateId,
    pub kind: CommissionKind,
    /// Party whose action triggered the credit (the paying client), when known.
    pub actor_id: Option<AffiliateId>,
    /// Recruited account a recruitment commission derives from.
    pub recruit_id: Option<AffiliateId>,
    /// Credits to `affiliate_id` inside the velocity window, excluding this one.
    pub recent_credits: usize,
    /// Attribution cookie behind a direct credit.
    pub click: Option<AttributionCookie>,
    pub action_at: DateTime<Utc>,
}

impl ScreenContext {
    pub fn new(affiliate_id: AffiliateId, kind: CommissionKind, action_at: DateTime<Utc>) -> Self {
        Self {
            affiliate_id,
            kind,
            actor_id: None,
            recruit_id: None,
            recent_credits: 0,
            click: None,
            action_at,
        }
    }
}

/// Accounts seen on one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceAccounts {
    pub accounts: BTreeSet<AffiliateId>,
}

impl Aggregate for DeviceAccounts {
    const DOMAIN: &'static str = "fraud.device";

    fn apply(&mut self, page: &EventPage) {
        if let LedgerEvent::DeviceObserved { account_id, .. } = &page.event {
            self.accounts.insert(account_id.clone());
        }
    }
}

/// SHA-256 of a normalized device fingerprint or client address.
///
/// IPv4-mapped IPv6 addresses (`::ffff:1.2.3.4`) hash the same as the bare
/// IPv4 address.
pub fn hash_fingerprint(raw: &str) -> String {
    let normalized = raw.trim().to_ascii_lowercase();
    let normalized = normalized
        .strip_prefix("::ffff:")
        .unwrap_or(&normalized);
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

pub struct FraudGate {
    repo: Repository,
    graph: Arc<ReferralGraph>,
    config: FraudConfig,
}

impl FraudGate {
    pub fn new(repo: Repository, graph: Arc<ReferralGraph>, config: FraudConfig) -> Self {
        Self {
            repo,
            graph,
            config,
        }
    }

    pub fn config(&self) -> &FraudConfig {
        &self.config
    }

    /// Record that `account` was seen on a device. Returns the device hash.
    pub async fn record_device(
        &self,
        account: &AffiliateId,
        raw_fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<String, GraphError> {
        let hash = hash_fingerprint(raw_fingerprint);
        self.repo
            .execute::<DeviceAccounts, _, GraphError, _>(stream_root("device", &hash), |loaded| {
                if loaded.state.accounts.contains(account) {
                    return Ok(Decision::Done(()));
                }
                Ok(Decision::Append(
                    vec![NewEvent::new(LedgerEvent::DeviceObserved {
                        account_id: account.clone(),
                        at,
                    })],
                    (),
                ))
            })
            .await?;
        Ok(hash)
    }

    /// Accounts observed on a hashed device.
    pub async fn accounts_on_device(&self, hash: &str) -> Result<BTreeSet<AffiliateId>, GraphError> {
        let loaded = self
            .repo
            .load::<DeviceAccounts>(stream_root("device", hash))
            .await?;
        Ok(loaded.state.accounts)
    }

    /// Judge one credit. The most severe finding wins.
    pub async fn screen(&self, ctx: &ScreenContext) -> Result<Verdict, GraphError> {
        let findings = [
            self.check_self_referral(ctx),
            self.check_velocity(ctx),
            self.check_device_cluster(ctx).await?,
            self.check_click_pattern(ctx),
        ];

        let verdict = findings
            .into_iter()
            .max_by_key(Verdict::severity)
            .unwrap_or(Verdict::Clear);

        match &verdict {
            Verdict::Clear => {}
            Verdict::Flagged(reason) => warn!(
                affiliate_id = %ctx.affiliate_id,
                kind = ctx.kind.as_str(),
                %reason,
                "Commission flagged for review"
            ),
            Verdict::Blocked(reason) => warn!(
                affiliate_id = %ctx.affiliate_id,
                kind = ctx.kind.as_str(),
                %reason,
                "Commission blocked"
            ),
        }
        Ok(verdict)
    }

    fn check_self_referral(&self, ctx: &ScreenContext) -> Verdict {
        let acting_self = ctx.actor_id.as_ref() == Some(&ctx.affiliate_id)
            || ctx.recruit_id.as_ref() == Some(&ctx.affiliate_id);
        if acting_self {
            Verdict::Blocked("self-referral".to_string())
        } else {
            Verdict::Clear
        }
    }

    fn check_velocity(&self, ctx: &ScreenContext) -> Verdict {
        let window_mins = self.config.velocity_window_secs / 60;
        if ctx.recent_credits >= self.config.velocity_block {
            Verdict::Blocked(format!(
                "velocity: {} credits in {window_mins}m",
                ctx.recent_credits
            ))
        } else if ctx.recent_credits >= self.config.velocity_flag {
            Verdict::Flagged(format!(
                "velocity: {} credits in {window_mins}m",
                ctx.recent_credits
            ))
        } else {
            Verdict::Clear
        }
    }

    /// Children of the credited parent sharing the recruit's device.
    async fn check_device_cluster(&self, ctx: &ScreenContext) -> Result<Verdict, GraphError> {
        let Some(recruit) = &ctx.recruit_id else {
            return Ok(Verdict::Clear);
        };
        let children = self.graph.children_of(&ctx.affiliate_id).await?;
        let Some(fingerprint) = children
            .iter()
            .find(|edge| &edge.child == recruit)
            .and_then(|edge| edge.fingerprint.clone())
        else {
            return Ok(Verdict::Clear);
        };

        let on_device = self.accounts_on_device(&fingerprint).await?;
        let cluster = children
            .iter()
            .filter(|edge| {
                edge.fingerprint.as_deref() == Some(fingerprint.as_str())
                    || on_device.contains(&edge.child)
            })
            .map(|edge| &edge.child)
            .collect::<BTreeSet<_>>()
            .len();

        Ok(if cluster >= self.config.cluster_block {
            Verdict::Blocked(format!("device cluster: {cluster} recruits share a device"))
        } else if cluster >= self.config.cluster_flag {
            Verdict::Flagged(format!("device cluster: {cluster} recruits share a device"))
        } else {
            Verdict::Clear
        })
    }

    fn check_click_pattern(&self, ctx: &ScreenContext) -> Verdict {
        let Some(click) = &ctx.click else {
            return Verdict::Clear;
        };
        if click
            .context
            .as_ref()
            .is_some_and(|context| !context.has_navigation())
        {
            return Verdict::Flagged("cookie stuffing: click without navigation".to_string());
        }
        let elapsed = ctx.action_at - click.created_at;
        if elapsed.num_seconds() < self.config.min_click_to_action_secs as i64 {
            return Verdict::Flagged(format!(
                "cookie stuffing: action {}s after click",
                elapsed.num_seconds()
            ));
        }
        Verdict::Clear
    }
}
