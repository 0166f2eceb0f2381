//! Leader election using Kubernetes Leases
//!
//! Only one replica may reconcile MachineSets at a time: two controllers
//! deferring and rewriting the same object would fight exactly like the
//! writers this crate arbitrates between.
//!
//! # Atomicity
//!
//! Every lease write is a `create` or a `replace` carrying the resourceVersion
//! that was read. A concurrent change fails with 409 Conflict, which is
//! treated as "someone else won" rather than an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, FIELD_MANAGER};

/// Lease name shared by all replicas
pub const LEADER_LEASE_NAME: &str = "machineset-sync-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What this replica may do with the lease it just read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseClaim {
    /// No lease yet: create it
    Create,
    /// We hold it: bump the renew time
    Renew,
    /// Holder stopped renewing (or released it): take it over
    TakeOver {
        /// Transition count to write
        transitions: i32,
    },
    /// Another replica holds a live lease
    HeldBy(String),
}

/// Decide how to claim `existing` as `identity` at `now`
pub fn lease_claim(existing: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseClaim {
    let Some(lease) = existing else {
        return LeaseClaim::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());

    if holder == Some(identity) {
        return LeaseClaim::Renew;
    }

    let expired = match (
        spec.and_then(|s| s.renew_time.as_ref()),
        spec.and_then(|s| s.lease_duration_seconds),
    ) {
        (Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    };

    match holder {
        Some(other) if !other.is_empty() && !expired => LeaseClaim::HeldBy(other.to_string()),
        _ => LeaseClaim::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
        },
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create an elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: LEADER_LEASE_NAME.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    /// Block until leadership is acquired, then return a guard that keeps
    /// renewing it
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return self.start_renewal();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "lease held by another replica"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "failed to acquire lease, retrying"
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn start_renewal(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// One read-decide-write round; `Ok(false)` when another replica holds
    /// the lease or won a concurrent write
    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api = self.api();
        let existing = api.get_opt(&self.lease_name).await?;
        let now = Utc::now();

        let lease = match lease_claim(existing.as_ref(), &self.identity, now) {
            LeaseClaim::HeldBy(holder) => {
                debug!(holder = %holder, "lease is held");
                return Ok(false);
            }
            LeaseClaim::Create => self.fresh_lease(None, now, 0),
            LeaseClaim::TakeOver { transitions } => {
                let rv = existing.and_then(|l| l.metadata.resource_version);
                self.fresh_lease(rv, now, transitions)
            }
            LeaseClaim::Renew => {
                let Some(mut lease) = existing else {
                    return Ok(false);
                };
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                lease
            }
        };

        let result = if lease.metadata.resource_version.is_some() {
            api.replace(&self.lease_name, &Self::post_params(), &lease).await
        } else {
            api.create(&Self::post_params(), &lease).await
        };

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => {
                debug!(identity = %self.identity, "lease changed concurrently");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn fresh_lease(
        &self,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.identity, "leadership lost to another replica");
                    break;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease renewal failed, leadership lost");
                    break;
                }
            }
        }
        let _ = lost_tx.send(());
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release(&self) -> Result<(), Error> {
        let api = self.api();
        let Some(mut lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };

        let held = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str());
        if !held {
            debug!(identity = %self.identity, "not the lease holder, nothing to release");
            return Ok(());
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
        }

        match api.replace(&self.lease_name, &Self::post_params(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "lease released");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Holds leadership while alive
///
/// Renewal runs in a background task that is aborted on drop.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release the lease (graceful shutdown)
    pub async fn release(self) -> Result<(), Error> {
        self.renewal_task.abort();
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed: Option<DateTime<Utc>>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEADER_LEASE_NAME.to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(30),
                renew_time: renewed.map(MicroTime),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_missing_lease_is_created() {
        assert_eq!(lease_claim(None, "pod-a", Utc::now()), LeaseClaim::Create);
    }

    #[test]
    fn test_own_lease_is_renewed() {
        let now = Utc::now();
        let l = lease(Some("pod-a"), Some(now), 0);
        assert_eq!(lease_claim(Some(&l), "pod-a", now), LeaseClaim::Renew);
    }

    #[test]
    fn test_live_foreign_lease_is_respected() {
        let now = Utc::now();
        let l = lease(Some("pod-b"), Some(now - chrono::Duration::seconds(10)), 2);
        assert_eq!(
            lease_claim(Some(&l), "pod-a", now),
            LeaseClaim::HeldBy("pod-b".to_string())
        );
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let now = Utc::now();
        let l = lease(Some("pod-b"), Some(now - chrono::Duration::seconds(31)), 2);
        assert_eq!(
            lease_claim(Some(&l), "pod-a", now),
            LeaseClaim::TakeOver { transitions: 3 }
        );
    }

    #[test]
    fn test_released_lease_is_taken_over_immediately() {
        let now = Utc::now();
        let l = lease(None, Some(now), 4);
        assert_eq!(
            lease_claim(Some(&l), "pod-a", now),
            LeaseClaim::TakeOver { transitions: 5 }
        );
    }

    #[test]
    fn test_lease_without_timing_counts_as_expired() {
        let l = lease(Some("pod-b"), None, 0);
        assert_eq!(
            lease_claim(Some(&l), "pod-a", Utc::now()),
            LeaseClaim::TakeOver { transitions: 1 }
        );
    }
}
