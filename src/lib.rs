//! machineset-sync - keeps GitOps-declared and autoscaler-driven MachineSet
//! replica counts from fighting each other
//!
//! Two writers touch `spec.replicas` of a worker MachineSet: the GitOps sync
//! tool (declared state from git) and a runtime scaler acting on the object
//! directly. The controller records the count it last reconciled to in an
//! annotation and uses it to tell which writer moved last, accepting
//! scale-ups immediately and holding scale-downs until no in-use node would
//! be removed.
//!
//! # Modules
//!
//! - [`classifier`] - Worker-pool predicates over loosely typed MachineSets
//! - [`resource`] - Nested field access and marker helpers for dynamic objects
//! - [`controller`] - MachineSet and Machine reconcilers
//! - [`controller_runner`] - Wiring of both reconcilers into kube-runtime controllers
//! - [`discovery`] - Startup resolution of Machine API resource names
//! - [`leader_election`] - Lease-based leader election
//! - [`health`] - Liveness/readiness probe server
//! - [`retry`] - Exponential backoff with jitter
//! - [`telemetry`] / [`metrics`] - Logging, tracing and OpenTelemetry instruments
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod classifier;
pub mod config;
pub mod controller;
pub mod controller_runner;
pub mod discovery;
pub mod error;
pub mod health;
pub mod leader_election;
pub mod metrics;
pub mod resource;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Machine API Constants
// =============================================================================

/// Role label carried by MachineSet pod templates and by Machines
pub const MACHINE_ROLE_LABEL: &str = "machine.openshift.io/cluster-api-machine-role";

/// Role label value identifying a worker pool
pub const WORKER_ROLE: &str = "worker";

/// Label naming a Machine's MachineSet when owner references are missing
pub const MACHINESET_LABEL: &str = "machine.openshift.io/cluster-api-machineset";

/// Controller-owned annotation holding the replica count last reconciled to
pub const LAST_RECONCILED_ANNOTATION: &str = "machineset-sync.io/last-reconciled-replicas";

/// Field manager used for writes and the leader-election lease
pub const FIELD_MANAGER: &str = "machineset-sync";

/// Default API group serving MachineSet and Machine
pub const MACHINE_API_GROUP: &str = "machine.openshift.io";

/// Default API version of MachineSet and Machine
pub const MACHINE_API_VERSION: &str = "v1beta1";

/// Namespace the Machine API objects live in by default
pub const MACHINE_API_NAMESPACE: &str = "openshift-machine-api";
