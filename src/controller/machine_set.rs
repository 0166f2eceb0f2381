//! MachineSet reconciliation
//!
//! Two writers compete for `spec.replicas` on a worker MachineSet: the GitOps
//! sync tool re-applying the declared count from git, and a runtime scaler
//! acting on the object directly. The controller keeps the count it last
//! reconciled to in an annotation and compares the declared count against it
//! on every pass:
//!
//! - scale-ups are accepted in the same pass
//! - scale-downs are accepted immediately when the pool has no available nodes
//! - otherwise a scale-down is deferred for at least one pass and a settle
//!   period, and keeps being deferred while the pool drains towards the
//!   target. It is accepted once the pool has drained. If the pool shows no
//!   drain at all over the settle period, `spec.replicas` is held at the
//!   last-reconciled count instead.
//!
//! Every write is a single version-checked `replace`. A conflict or a
//! transient store error re-fetches and recomputes the decision; nothing is
//! locked.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::classifier::{has_nodes_available, is_worker_machine_set};
use crate::config::ControllerConfig;
use crate::controller::machine::DrainActivity;
use crate::metrics;
use crate::resource::{
    available_replicas, declared_replicas, last_reconciled_replicas, object_key,
    set_declared_replicas, set_last_reconciled_replicas, LastReconciled,
};
use crate::retry::{retry_with_backoff, RetryError};
use crate::{Error, FIELD_MANAGER};

/// First error requeue delay; doubles per consecutive failure
const ERROR_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Ceiling for the error requeue delay
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Read/write access to MachineSets
///
/// Abstracted so reconcile passes can run against mocks or an in-memory store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineSetStore: Send + Sync {
    /// Fetch the current MachineSet, `None` if it no longer exists
    async fn get_machine_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Replace the MachineSet, rejected with 409 Conflict if its
    /// `resourceVersion` is stale
    async fn replace_machine_set(&self, machine_set: &DynamicObject)
        -> Result<DynamicObject, Error>;
}

/// [`MachineSetStore`] backed by the Kubernetes API
pub struct KubeMachineSetStore {
    client: Client,
    resource: ApiResource,
}

impl KubeMachineSetStore {
    /// Create a store for the discovered MachineSet resource
    pub fn new(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

#[async_trait]
impl MachineSetStore for KubeMachineSetStore {
    async fn get_machine_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn replace_machine_set(
        &self,
        machine_set: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let namespace = machine_set.namespace().ok_or_else(|| {
            Error::serialization_for_kind(&self.resource.kind, "object has no namespace")
        })?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self
            .api(&namespace)
            .replace(&machine_set.name_any(), &params, machine_set)
            .await?)
    }
}

/// Outcome of comparing the declared count with the last-reconciled marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationDecision {
    /// Not a worker pool, or no readable declared count
    Skip {
        /// Why the MachineSet was not considered
        reason: &'static str,
    },
    /// Declared count matches the marker, or the marker is being seeded
    Steady {
        /// Declared replica count
        replicas: i64,
        /// Marker was absent or unreadable and has to be written
        record: bool,
    },
    /// Declared count becomes the new last-reconciled count
    Accept {
        /// Previous last-reconciled count
        from: i64,
        /// Declared count being accepted
        to: i64,
    },
    /// Scale-down held back while nodes are in use; nothing is written
    Defer {
        /// Last-reconciled count
        from: i64,
        /// Declared (lower) count
        to: i64,
        /// Available nodes seen by this pass
        available: i64,
    },
    /// Scale-down refused after a deferral that saw no drain: `spec.replicas`
    /// restored to the last-reconciled count
    Rewrite {
        /// Declared count being overwritten
        declared: i64,
        /// Last-reconciled count written back
        to: i64,
    },
}

impl ReconciliationDecision {
    /// Stable label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skip { .. } => "skip",
            Self::Steady { .. } => "steady",
            Self::Accept { .. } => "accept",
            Self::Defer { .. } => "defer",
            Self::Rewrite { .. } => "rewrite",
        }
    }

    /// Copy of `machine_set` with this decision applied, or `None` when the
    /// decision writes nothing.
    ///
    /// The copy keeps the fetched `resourceVersion`, so replacing it fails on
    /// a concurrent change.
    pub fn apply(&self, machine_set: &DynamicObject) -> Option<DynamicObject> {
        let mut updated = machine_set.clone();
        match *self {
            Self::Skip { .. } | Self::Defer { .. } | Self::Steady { record: false, .. } => {
                return None
            }
            Self::Steady {
                replicas,
                record: true,
            } => set_last_reconciled_replicas(&mut updated, replicas),
            Self::Accept { to, .. } => set_last_reconciled_replicas(&mut updated, to),
            Self::Rewrite { to, .. } => set_declared_replicas(&mut updated, to),
        }
        Some(updated)
    }
}

/// In-memory record of a scale-down that is being deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingScaleDown {
    /// Declared count the scale-down is heading to
    pub target: i64,
    /// Passes that deferred this target so far
    pub deferred_passes: u32,
    /// When the target was first deferred
    pub since: Instant,
    /// Available nodes when the target was first deferred
    pub available_at_start: i64,
}

impl PendingScaleDown {
    fn new(target: i64, available_at_start: i64, since: Instant) -> Self {
        Self {
            target,
            deferred_passes: 1,
            since,
            available_at_start,
        }
    }

    /// Fewer nodes are available than when the deferral started
    fn has_drained_since_start(&self, available: i64) -> bool {
        available < self.available_at_start
    }

    fn is_settled(&self, target: i64, settle_period: Duration, now: Instant) -> bool {
        self.target == target
            && self.deferred_passes >= 1
            && now.saturating_duration_since(self.since) >= settle_period
    }
}

/// Compute the decision for one pass.
///
/// `pending` is the deferral record for this MachineSet, if any, and
/// `drain_observed` says whether one of its Machines was seen deleting since
/// that deferral started. The function is pure apart from logging; the caller
/// owns the record.
pub fn decide(
    machine_set: &DynamicObject,
    pending: Option<&PendingScaleDown>,
    drain_observed: bool,
    settle_period: Duration,
    now: Instant,
) -> ReconciliationDecision {
    if !is_worker_machine_set(machine_set) {
        return ReconciliationDecision::Skip {
            reason: "not a worker pool",
        };
    }

    let Some(declared) = declared_replicas(machine_set) else {
        return ReconciliationDecision::Skip {
            reason: "spec.replicas not set",
        };
    };

    let last = match last_reconciled_replicas(machine_set) {
        LastReconciled::Value(last) => last,
        LastReconciled::Unset => {
            return ReconciliationDecision::Steady {
                replicas: declared,
                record: true,
            }
        }
        LastReconciled::Invalid(raw) => {
            warn!(
                machine_set = %object_key(machine_set),
                marker = %raw,
                "unparsable last-reconciled marker, treating as unset"
            );
            return ReconciliationDecision::Steady {
                replicas: declared,
                record: true,
            };
        }
    };

    if declared == last {
        return ReconciliationDecision::Steady {
            replicas: declared,
            record: false,
        };
    }

    if declared > last || !has_nodes_available(machine_set) {
        return ReconciliationDecision::Accept {
            from: last,
            to: declared,
        };
    }

    let available = available_replicas(machine_set).unwrap_or(0);
    let defer = ReconciliationDecision::Defer {
        from: last,
        to: declared,
        available,
    };

    match pending {
        Some(p) if p.is_settled(declared, settle_period, now) => {
            if available <= declared {
                ReconciliationDecision::Accept {
                    from: last,
                    to: declared,
                }
            } else if drain_observed || p.has_drained_since_start(available) {
                defer
            } else {
                ReconciliationDecision::Rewrite { declared, to: last }
            }
        }
        _ => defer,
    }
}

/// Controller context for the MachineSet reconciler
///
/// Use [`ContextBuilder`] against a real cluster:
///
/// ```text
/// let ctx = Context::builder(client, resources.machine_set)
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// MachineSet access (trait object for testability)
    pub store: Arc<dyn MachineSetStore>,
    /// Discovered MachineSet resource
    pub resource: ApiResource,
    /// Controller tuning
    pub config: ControllerConfig,
    /// Deleting Machines per MachineSet, fed by the Machine reconciler
    pub drains: Arc<DrainActivity>,
    pending: DashMap<String, PendingScaleDown>,
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, resource: ApiResource) -> ContextBuilder {
        ContextBuilder::new(client, resource)
    }

    /// Context over an arbitrary store (tests, in-memory simulation)
    pub fn with_store(
        store: Arc<dyn MachineSetStore>,
        resource: ApiResource,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            resource,
            config,
            drains: Arc::new(DrainActivity::default()),
            pending: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// Deferral record for a MachineSet key
    pub fn pending_scale_down(&self, key: &str) -> Option<PendingScaleDown> {
        self.pending.get(key).map(|p| *p)
    }

    fn track(&self, key: &str, decision: &ReconciliationDecision, now: Instant) {
        match *decision {
            ReconciliationDecision::Defer { to, available, .. } => {
                self.pending
                    .entry(key.to_string())
                    .and_modify(|p| {
                        if p.target == to {
                            p.deferred_passes += 1;
                        } else {
                            *p = PendingScaleDown::new(to, available, now);
                        }
                    })
                    .or_insert_with(|| PendingScaleDown::new(to, available, now));
            }
            _ => {
                self.pending.remove(key);
            }
        }
    }

    fn forget(&self, key: &str) {
        self.pending.remove(key);
        self.failures.remove(key);
        self.drains.forget(key);
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    resource: ApiResource,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client, resource: ApiResource) -> Self {
        Self {
            client,
            resource,
            config: ControllerConfig::default(),
        }
    }

    /// Set controller tuning
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context against the Kubernetes API
    pub fn build(self) -> Context {
        let store = Arc::new(KubeMachineSetStore::new(self.client, self.resource.clone()));
        Context::with_store(store, self.resource, self.config)
    }
}

/// One fetch-decide-write attempt. `None` when the MachineSet is gone.
async fn reconcile_once(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Option<ReconciliationDecision>, Error> {
    let Some(current) = ctx.store.get_machine_set(namespace, name).await? else {
        return Ok(None);
    };

    let key = object_key(&current);
    let pending = ctx.pending_scale_down(&key);
    let drain_observed = pending
        .as_ref()
        .is_some_and(|p| ctx.drains.seen_since(&key, p.since));
    let decision = decide(
        &current,
        pending.as_ref(),
        drain_observed,
        ctx.config.scale_down_settle_period,
        Instant::now(),
    );

    if let Some(updated) = decision.apply(&current) {
        ctx.store.replace_machine_set(&updated).await?;
    }

    Ok(Some(decision))
}

/// Reconcile a MachineSet
#[instrument(skip(machine_set, ctx), fields(machine_set = %object_key(&machine_set)))]
pub async fn reconcile(machine_set: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = Instant::now();
    let result = reconcile_inner(&machine_set, &ctx).await;
    metrics::record_duration("machineset", start.elapsed().as_secs_f64());
    result
}

async fn reconcile_inner(machine_set: &DynamicObject, ctx: &Context) -> Result<Action, Error> {
    let key = object_key(machine_set);
    let name = machine_set.name_any();
    let Some(namespace) = machine_set.namespace() else {
        return Err(Error::serialization_for_kind(
            &ctx.resource.kind,
            format!("{key} has no namespace"),
        ));
    };

    let (namespace, name) = (namespace.as_str(), name.as_str());
    let outcome = retry_with_backoff(
        &ctx.config.store_retry,
        "machineset-pass",
        Error::is_retryable,
        move || reconcile_once(ctx, namespace, name),
    )
    .await;

    let decision = match outcome {
        Ok(Some(decision)) => decision,
        Ok(None) => {
            debug!("MachineSet no longer exists");
            ctx.forget(&key);
            return Ok(Action::await_change());
        }
        Err(RetryError {
            last,
            attempts,
            exhausted,
        }) => {
            if exhausted && last.is_conflict() {
                return Err(Error::conflict(key, attempts));
            }
            return Err(last);
        }
    };

    ctx.track(&key, &decision, Instant::now());
    ctx.failures.remove(&key);
    metrics::record_decision(decision.label());

    let action = match decision {
        ReconciliationDecision::Skip { reason } => {
            debug!(reason, "skipping MachineSet");
            Action::await_change()
        }
        ReconciliationDecision::Steady { replicas, record } => {
            if record {
                info!(replicas, "recorded last-reconciled replicas");
            } else {
                debug!(replicas, "MachineSet is steady");
            }
            Action::requeue(ctx.config.resync_interval)
        }
        ReconciliationDecision::Accept { from, to } => {
            info!(from, to, "accepted replica change");
            Action::requeue(ctx.config.resync_interval)
        }
        ReconciliationDecision::Defer {
            from,
            to,
            available,
        } => {
            let passes = ctx
                .pending_scale_down(&key)
                .map_or(1, |p| p.deferred_passes);
            info!(
                from,
                to,
                available,
                deferred_passes = passes,
                "deferring scale-down while nodes are available"
            );
            Action::requeue(ctx.config.defer_requeue())
        }
        ReconciliationDecision::Rewrite { declared, to } => {
            warn!(
                declared,
                restored = to,
                "scale-down saw no drain while nodes are in use, restored last-reconciled replicas"
            );
            Action::requeue(ctx.config.resync_interval)
        }
    };

    Ok(action)
}

/// Requeue with exponential backoff per MachineSet
pub fn error_policy(machine_set: Arc<DynamicObject>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&machine_set);
    let failures = {
        let mut count = ctx.failures.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    };
    let delay = error_backoff(failures);

    error!(
        ?error,
        machine_set = %key,
        failures,
        retry_in_secs = delay.as_secs(),
        "reconciliation failed"
    );
    metrics::record_error("machineset", error.kind_label());

    Action::requeue(delay)
}

fn error_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(6);
    (ERROR_BACKOFF_BASE * 2u32.pow(exponent)).min(ERROR_BACKOFF_MAX)
}
