//! Controller runner - builds the MachineSet and Machine controller futures
//!
//! Both controllers watch dynamically discovered resources. The Machine
//! controller feeds the MachineSet controller through a trigger channel so
//! availability flips re-queue the owning MachineSet, and shares the Machine
//! deletions it sees so a draining pool keeps its scale-down deferred.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::ControllerConfig;
use crate::controller::{machine, machine_set, Context, MachineContext, MachineSetTrigger};
use crate::discovery::MachineApiResources;
use crate::resource::object_key;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// How often tracked Machines are checked against the watch cache
const TRACKER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn dynamic_api(client: Client, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, resource),
        None => Api::all_with(client, resource),
    }
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build both controller futures
///
/// The futures run until a shutdown signal is received.
pub fn build_controllers(
    client: Client,
    resources: &MachineApiResources,
    config: ControllerConfig,
) -> Vec<ControllerFuture> {
    let namespace = config.namespace.clone();
    let (trigger, trigger_rx) = MachineSetTrigger::channel(resources.machine_set.clone());

    let ms_ctx = Arc::new(
        Context::builder(client.clone(), resources.machine_set.clone())
            .config(config)
            .build(),
    );
    let machine_ctx = Arc::new(MachineContext::new(trigger, ms_ctx.drains.clone()));

    match namespace.as_deref() {
        Some(ns) => tracing::info!(namespace = %ns, "- MachineSet controller"),
        None => tracing::info!("- MachineSet controller (all namespaces)"),
    }
    tracing::info!("- Machine controller");

    let machine_sets = dynamic_api(client.clone(), &resources.machine_set, namespace.as_deref());
    let machines = dynamic_api(client, &resources.machine, namespace.as_deref());

    let ms_ctrl = Controller::new_with(machine_sets, watcher_config(), resources.machine_set.clone())
        .reconcile_on(UnboundedReceiverStream::new(trigger_rx))
        .shutdown_on_signal()
        .run(machine_set::reconcile, machine_set::error_policy, ms_ctx)
        .for_each(log_reconcile_result("MachineSet"));

    let machine_controller =
        Controller::new_with(machines, watcher_config(), resources.machine.clone());
    let machine_cache = machine_controller.store();
    let sweep = sweep_vanished_machines(machine_cache, machine_ctx.clone());
    let machine_ctrl = machine_controller
        .shutdown_on_signal()
        .run(machine::reconcile, machine::error_policy, machine_ctx)
        .for_each(log_reconcile_result("Machine"));

    // The sweep never finishes on its own; it stops with the controller
    let machine_ctrl = async move {
        tokio::select! {
            _ = machine_ctrl => {}
            _ = sweep => {}
        }
    };

    vec![Box::pin(ms_ctrl), Box::pin(machine_ctrl)]
}

/// Keys of every Machine currently in the watch cache
fn live_machine_keys(cache: &Store<DynamicObject>) -> HashSet<String> {
    cache.state().iter().map(|m| object_key(m)).collect()
}

/// Periodically drop tracked Machines that left the watch cache
///
/// Deleted objects are never reconciled, so this is the only place their
/// availability entries go away. Waits for the first full list so an empty
/// cache is never mistaken for "everything was deleted".
async fn sweep_vanished_machines(cache: Store<DynamicObject>, ctx: Arc<MachineContext>) {
    if cache.wait_until_ready().await.is_err() {
        tracing::warn!("Machine watch cache closed before it was ready, tracker sweep disabled");
        return;
    }

    let mut ticks = tokio::time::interval(TRACKER_SWEEP_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticks.tick().await;
        ctx.sweep(&live_machine_keys(&cache));
    }
}

/// Create a closure that logs reconciliation results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
