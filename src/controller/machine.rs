//! Machine availability tracking
//!
//! Machines never get written. Their phase is reduced to "available or not"
//! and every flip of that bit re-queues the owning MachineSet, so a deferred
//! scale-down is looked at again as soon as a node drains or comes up.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::classifier::is_worker_machine;
use crate::discovery::MACHINE_SET_KIND;
use crate::metrics;
use crate::resource::{object_key, NestedFields, STATUS_PHASE};
use crate::{Error, MACHINESET_LABEL};

/// Lifecycle phase of a Machine, reduced to what availability needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachinePhase {
    /// Not yet running (`Provisioning`, `Provisioned`, or no phase)
    Provisioning,
    /// Backing node is up
    Running,
    /// Being removed (phase `Deleting` or a deletion timestamp)
    Deleting,
    /// Terminal provider failure
    Failed,
}

impl MachinePhase {
    /// Derive the phase of a Machine
    pub fn of(machine: &DynamicObject) -> Self {
        if machine.metadata.deletion_timestamp.is_some() {
            return Self::Deleting;
        }
        match machine.nested_str(STATUS_PHASE) {
            Some("Running") => Self::Running,
            Some("Deleting") => Self::Deleting,
            Some("Failed") => Self::Failed,
            _ => Self::Provisioning,
        }
    }

    /// Only a running Machine backs an available node
    pub fn is_available(self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Name of the MachineSet owning `machine`
///
/// Owner references win; the MachineSet label covers Machines whose owner
/// reference was stripped (e.g. after a backup restore).
pub fn owning_machine_set(machine: &DynamicObject) -> Option<String> {
    machine
        .owner_references()
        .iter()
        .find(|owner| owner.kind == MACHINE_SET_KIND)
        .map(|owner| owner.name.clone())
        .or_else(|| machine.labels().get(MACHINESET_LABEL).cloned())
}

/// MachineSet a Machine belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSetRef {
    /// Namespace shared with the Machine
    pub namespace: Option<String>,
    /// MachineSet name
    pub name: String,
}

impl MachineSetRef {
    /// Owner of `machine`, see [`owning_machine_set`]
    pub fn of(machine: &DynamicObject) -> Option<Self> {
        owning_machine_set(machine).map(|name| Self {
            namespace: machine.namespace(),
            name,
        })
    }

    /// Same `namespace/name` key the MachineSet reconciler uses
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

/// What was last seen of a Machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMachine {
    /// Backed an available node
    pub available: bool,
    /// Owning MachineSet, if one could be resolved
    pub owner: Option<MachineSetRef>,
}

/// Last-seen availability per Machine key
#[derive(Default)]
pub struct AvailabilityTracker {
    last_seen: DashMap<String, TrackedMachine>,
}

impl AvailabilityTracker {
    /// New availability if `phase` differs from what was last recorded
    ///
    /// A Machine seen for the first time only counts as a transition when it
    /// is already running; anything else has not backed a node yet.
    pub fn transition(&self, key: &str, phase: MachinePhase) -> Option<bool> {
        let available = phase.is_available();
        match self.last_seen.get(key).map(|seen| seen.available) {
            Some(previous) if previous == available => None,
            Some(_) => Some(available),
            None if available => Some(true),
            None => None,
        }
    }

    /// Record `phase`; Machines entering `Deleting` are dropped
    pub fn record(&self, key: &str, phase: MachinePhase, owner: Option<MachineSetRef>) {
        if phase == MachinePhase::Deleting {
            self.last_seen.remove(key);
        } else {
            self.last_seen.insert(
                key.to_string(),
                TrackedMachine {
                    available: phase.is_available(),
                    owner,
                },
            );
        }
    }

    /// Drop a Machine from tracking
    pub fn forget(&self, key: &str) {
        self.last_seen.remove(key);
    }

    /// Drop every Machine whose key is not in `live` and return what was
    /// last seen of them
    ///
    /// Machines deleted while the watch was down never show a `Deleting`
    /// phase here, so their entries are only cleared by this sweep.
    pub fn retain_live(&self, live: &HashSet<String>) -> Vec<TrackedMachine> {
        let gone: Vec<String> = self
            .last_seen
            .iter()
            .filter(|entry| !live.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        gone.iter()
            .filter_map(|key| self.last_seen.remove(key).map(|(_, seen)| seen))
            .collect()
    }

    /// Number of Machines tracked
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    /// True when no Machine is tracked
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// When a Machine of each MachineSet was last seen being deleted
///
/// Shared with the MachineSet reconciler, which keeps deferring a scale-down
/// while its pool is visibly draining.
#[derive(Default)]
pub struct DrainActivity {
    last_deleting: DashMap<String, Instant>,
}

impl DrainActivity {
    /// Note a deleting Machine of the MachineSet `machine_set_key`
    pub fn record(&self, machine_set_key: &str) {
        self.last_deleting
            .insert(machine_set_key.to_string(), Instant::now());
    }

    /// True if a deleting Machine of the MachineSet was seen at or after `since`
    pub fn seen_since(&self, machine_set_key: &str, since: Instant) -> bool {
        self.last_deleting
            .get(machine_set_key)
            .is_some_and(|seen| *seen >= since)
    }

    /// Drop the record of a MachineSet that no longer exists
    pub fn forget(&self, machine_set_key: &str) {
        self.last_deleting.remove(machine_set_key);
    }
}

/// Sending half of the Machine to MachineSet re-queue channel
///
/// The receiving half is fed to the MachineSet controller's `reconcile_on`.
#[derive(Clone)]
pub struct MachineSetTrigger {
    tx: mpsc::UnboundedSender<ObjectRef<DynamicObject>>,
    resource: ApiResource,
}

impl MachineSetTrigger {
    /// Create a trigger and the matching receiver
    pub fn channel(
        resource: ApiResource,
    ) -> (Self, mpsc::UnboundedReceiver<ObjectRef<DynamicObject>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, resource }, rx)
    }

    /// Re-queue the MachineSet `name` in `namespace`
    pub fn send(&self, namespace: Option<&str>, name: &str) -> Result<(), Error> {
        let mut obj_ref = ObjectRef::new_with(name, self.resource.clone());
        if let Some(ns) = namespace {
            obj_ref = obj_ref.within(ns);
        }
        self.tx.send(obj_ref).map_err(|_| {
            Error::internal_with_context("trigger", "MachineSet controller is not running")
        })
    }
}

/// Controller context for the Machine reconciler
pub struct MachineContext {
    /// Re-queue channel to the MachineSet controller
    pub trigger: MachineSetTrigger,
    /// Last-seen availability per Machine
    pub tracker: AvailabilityTracker,
    /// Deleting Machines per MachineSet, read by the MachineSet reconciler
    pub drains: Arc<DrainActivity>,
}

impl MachineContext {
    /// Create a context sending re-queues through `trigger` and reporting
    /// deletions into `drains`
    pub fn new(trigger: MachineSetTrigger, drains: Arc<DrainActivity>) -> Self {
        Self {
            trigger,
            tracker: AvailabilityTracker::default(),
            drains,
        }
    }

    /// Prune Machines that are no longer in the watch cache
    ///
    /// A pruned Machine that last backed an available node re-queues its
    /// MachineSet, since that node is gone without a trigger having been sent.
    /// Returns the number of pruned entries.
    pub fn sweep(&self, live: &HashSet<String>) -> usize {
        let gone = self.tracker.retain_live(live);
        for seen in &gone {
            let (true, Some(owner)) = (seen.available, &seen.owner) else {
                continue;
            };
            match self.trigger.send(owner.namespace.as_deref(), &owner.name) {
                Ok(()) => metrics::record_trigger(false),
                Err(e) => warn!(machine_set = %owner.key(), error = %e, "failed to re-queue MachineSet"),
            }
        }
        if !gone.is_empty() {
            debug!(pruned = gone.len(), "pruned vanished Machines");
        }
        gone.len()
    }
}

/// Reconcile a Machine: re-queue its MachineSet on availability changes
#[instrument(skip(machine, ctx), fields(machine = %object_key(&machine)))]
pub async fn reconcile(machine: Arc<DynamicObject>, ctx: Arc<MachineContext>) -> Result<Action, Error> {
    let start = Instant::now();
    let result = reconcile_inner(&machine, &ctx);
    metrics::record_duration("machine", start.elapsed().as_secs_f64());
    result
}

fn reconcile_inner(machine: &DynamicObject, ctx: &MachineContext) -> Result<Action, Error> {
    let key = object_key(machine);

    if !is_worker_machine(machine) {
        debug!("not a worker Machine");
        ctx.tracker.forget(&key);
        return Ok(Action::await_change());
    }

    let phase = MachinePhase::of(machine);
    let owner = MachineSetRef::of(machine);

    if let (MachinePhase::Deleting, Some(owner)) = (phase, &owner) {
        ctx.drains.record(&owner.key());
    }

    let Some(available) = ctx.tracker.transition(&key, phase) else {
        ctx.tracker.record(&key, phase, owner);
        return Ok(Action::await_change());
    };

    match &owner {
        Some(owner) => {
            // Recorded only after a successful send so a failed pass re-emits
            ctx.trigger.send(owner.namespace.as_deref(), &owner.name)?;
            metrics::record_trigger(available);
            info!(
                machine_set = %owner.name,
                ?phase,
                available,
                "Machine availability changed, re-queued MachineSet"
            );
        }
        None => {
            warn!(?phase, "Machine has no owning MachineSet");
        }
    }

    ctx.tracker.record(&key, phase, owner);
    Ok(Action::await_change())
}

/// Retry a failed Machine pass after a fixed delay
pub fn error_policy(machine: Arc<DynamicObject>, error: &Error, _ctx: Arc<MachineContext>) -> Action {
    error!(
        ?error,
        machine = %object_key(&machine),
        "reconciliation failed"
    );
    metrics::record_error("machine", error.kind_label());
    Action::requeue(Duration::from_secs(5))
}
