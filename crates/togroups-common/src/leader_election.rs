//! Lease-based leader election
//!
//! With several replicas only the lease holder runs the derivative
//! controllers, so two operators never write the same derivative.
//!
//! Every write to the Lease carries the resourceVersion that was read; a 409
//! means someone else moved first and counts as "not leader" for that round.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{Error, Result, FIELD_MANAGER};

/// Lease name shared by all replicas
pub const LEADER_LEASE_NAME: &str = "togroups-operator-leader";

/// Lease timing
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseTiming {
    /// How long a lease stays valid without renewal
    pub duration: Duration,
    /// How often the holder renews
    pub renew_every: Duration,
    /// How often a standby retries
    pub retry_every: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            renew_every: Duration::from_secs(10),
            retry_every: Duration::from_secs(5),
        }
    }
}

/// What to do with the lease as read
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaseDecision {
    Create,
    Renew,
    TakeOver { transitions: i32 },
    Wait,
}

fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(spec) = lease.map(|l| l.spec.clone().unwrap_or_default()) else {
        return LeaseDecision::Create;
    };

    if spec.holder_identity.as_deref() == Some(identity) {
        return LeaseDecision::Renew;
    }

    let expires = spec
        .renew_time
        .zip(spec.lease_duration_seconds)
        .map(|(renewed, secs)| renewed.0 + chrono::Duration::seconds(i64::from(secs)));
    match expires {
        Some(expires) if now <= expires => LeaseDecision::Wait,
        _ => LeaseDecision::TakeOver {
            transitions: spec.lease_transitions.unwrap_or(0),
        },
    }
}

/// Competes for the operator lease
pub struct LeaderElector {
    leases: Api<Lease>,
    lease_name: String,
    identity: String,
    timing: LeaseTiming,
}

impl LeaderElector {
    /// Elector for `lease_name` in `namespace`, competing as `identity`
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            timing: LeaseTiming::default(),
        }
    }

    /// Wait until this replica holds the lease
    ///
    /// API errors while waiting are logged and retried. The returned guard
    /// renews in the background until it is dropped or a renewal fails.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        loop {
            match self.try_hold().await {
                Ok(true) => break,
                Ok(false) => debug!(identity = %self.identity, "Lease held by another replica"),
                Err(e) => warn!(identity = %self.identity, error = %e, "Lease check failed"),
            }
            tokio::time::sleep(self.timing.retry_every).await;
        }
        info!(identity = %self.identity, lease = %self.lease_name, "Leadership acquired");

        let (leading_tx, leading_rx) = watch::channel(true);
        let renewer = Arc::clone(&self);
        let renewal = tokio::spawn(async move { renewer.keep_renewing(leading_tx).await });
        LeaderGuard {
            elector: self,
            renewal,
            leading: leading_rx,
        }
    }

    async fn keep_renewing(&self, leading: watch::Sender<bool>) {
        let mut ticker = tokio::time::interval(self.timing.renew_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.try_hold().await {
                Ok(true) => debug!(identity = %self.identity, "Lease renewed"),
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease taken by another replica");
                    break;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed");
                    break;
                }
            }
        }
        let _ = leading.send(false);
    }

    fn lease_for(&self, now: DateTime<Utc>, version: Option<String>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version: version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.timing.duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// One round: returns true if this replica holds the lease afterwards
    async fn try_hold(&self) -> Result<bool> {
        let now = Utc::now();
        let current = self.leases.get_opt(&self.lease_name).await?;
        let version = current.as_ref().and_then(|l| l.metadata.resource_version.clone());

        let written = match decide(current.as_ref(), &self.identity, now) {
            LeaseDecision::Wait => return Ok(false),
            LeaseDecision::Create => {
                let lease = self.lease_for(now, None, 0);
                self.leases.create(&PostParams::default(), &lease).await
            }
            LeaseDecision::Renew => {
                let mut lease = current.unwrap_or_default();
                if version.is_none() {
                    return Err(missing_version(&self.lease_name));
                }
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.leases
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await
            }
            LeaseDecision::TakeOver { transitions } => {
                let version = version.ok_or_else(|| missing_version(&self.lease_name))?;
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Taking over expired lease"
                );
                let lease = self.lease_for(now, Some(version), transitions + 1);
                self.leases
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await
            }
        };

        match written {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the holder so a standby takes over without waiting for expiry
    async fn release(&self) -> Result<()> {
        let Some(lease) = self.leases.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        let holder = lease.spec.and_then(|s| s.holder_identity);
        if holder.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }

        let lapsed = 2 * self.timing.duration.as_secs() as i64;
        let expired = Utc::now() - chrono::Duration::seconds(lapsed);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(expired),
            }
        });
        self.leases
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

fn missing_version(lease: &str) -> Error {
    Error::internal_with_context(
        "leader_election",
        format!("lease {lease} has no resourceVersion"),
    )
}

/// Held leadership; renewal stops when the guard is dropped
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    leading: watch::Receiver<bool>,
}

impl LeaderGuard {
    /// Resolves once a renewal fails or another replica takes the lease
    pub async fn lost(&mut self) {
        let _ = self.leading.wait_for(|leading| !*leading).await;
    }

    /// Stop renewing and hand the lease over
    pub async fn release_leadership(&self) -> Result<()> {
        self.renewal.abort();
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
