//! machineset-sync - reconciles GitOps-declared and autoscaler-driven
//! MachineSet replica counts

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use kube::Client;
use rand::Rng;

use machineset_sync::config::ControllerConfig;
use machineset_sync::controller_runner::build_controllers;
use machineset_sync::discovery::discover_machine_api;
use machineset_sync::health::{self, Readiness};
use machineset_sync::leader_election::LeaderElector;
use machineset_sync::retry::RetryConfig;
use machineset_sync::telemetry::{init_telemetry, TelemetryConfig};
use machineset_sync::{MACHINE_API_GROUP, MACHINE_API_NAMESPACE, MACHINE_API_VERSION};

/// Keeps GitOps-declared and autoscaler-driven MachineSet replica counts from
/// fighting each other
#[derive(Parser, Debug)]
#[command(name = "machineset-sync", version, about, long_about = None)]
struct Cli {
    /// Address the liveness/readiness probe endpoint binds to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,

    /// Enable leader election; only the leader runs the controllers
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace holding the leader-election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "machineset-sync")]
    leader_election_namespace: String,

    /// Identity written to the lease (defaults to a random name)
    #[arg(long, env = "POD_NAME")]
    leader_election_identity: Option<String>,

    /// Seconds a guarded scale-down stays deferred before it is finalized
    #[arg(long, env = "SCALE_DOWN_SETTLE_SECONDS", default_value_t = 15)]
    scale_down_settle_seconds: u64,

    /// Fetch-decide-write attempts per pass before a conflict or transient
    /// store error fails it
    #[arg(long, env = "STORE_RETRIES", default_value_t = 5)]
    store_retries: u32,

    /// API group serving MachineSet and Machine
    #[arg(long, env = "MACHINE_API_GROUP", default_value = MACHINE_API_GROUP)]
    machine_api_group: String,

    /// API version of MachineSet and Machine
    #[arg(long, env = "MACHINE_API_VERSION", default_value = MACHINE_API_VERSION)]
    machine_api_version: String,

    /// Namespace to watch; empty watches all namespaces
    #[arg(long, env = "WATCH_NAMESPACE", default_value = MACHINE_API_NAMESPACE)]
    namespace: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the MachineSet and Machine controllers (default mode)
    Controller,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            api_group: self.machine_api_group.clone(),
            api_version: self.machine_api_version.clone(),
            namespace: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
            scale_down_settle_period: Duration::from_secs(self.scale_down_settle_seconds),
            store_retry: RetryConfig::with_max_attempts(self.store_retries),
            ..Default::default()
        }
    }

    fn identity(&self) -> String {
        self.leader_election_identity.clone().unwrap_or_else(|| {
            let suffix: u32 = rand::thread_rng().gen();
            format!("machineset-sync-{suffix:08x}")
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client needs a process-wide rustls provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if let Err(e) = init_telemetry(TelemetryConfig::default()) {
        eprintln!("CRITICAL: {e}");
        std::process::exit(1);
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli).await,
    }
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let config = cli.controller_config();
    tracing::info!(
        group = %config.api_group,
        version = %config.api_version,
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        settle_secs = config.scale_down_settle_period.as_secs(),
        store_retries = config.store_retry.max_attempts,
        "starting machineset-sync"
    );

    let readiness = Readiness::new();
    let listener = match health::bind(cli.health_probe_bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "unable to set up health probes");
            std::process::exit(1);
        }
    };
    let probe_readiness = readiness.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(listener, probe_readiness).await {
            tracing::error!(error = %e, "health probe server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let resources =
        match discover_machine_api(client.clone(), &config.api_group, &config.api_version).await {
            Ok(resources) => resources,
            Err(e) => {
                tracing::error!(error = %e, "unable to resolve Machine API resources");
                std::process::exit(1);
            }
        };

    let guard = if cli.leader_elect {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &cli.leader_election_namespace,
            &cli.identity(),
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    tracing::info!("Starting controllers:");
    let controllers = futures::future::join_all(build_controllers(client, &resources, config));
    readiness.mark_ready();

    match guard {
        Some(mut guard) => {
            let lost = tokio::select! {
                _ = controllers => false,
                _ = guard.lost() => true,
            };
            readiness.mark_not_ready();
            if lost {
                tracing::error!("leadership lost, exiting so a standby can take over");
                std::process::exit(1);
            }
            if let Err(e) = guard.release().await {
                tracing::warn!(error = %e, "failed to release leader lease");
            }
        }
        None => {
            controllers.await;
            readiness.mark_not_ready();
        }
    }

    tracing::info!("controllers stopped");
    Ok(())
}
