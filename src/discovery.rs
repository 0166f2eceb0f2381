//! Startup resolution of Machine API resource names
//!
//! The plural names of the MachineSet and Machine kinds are not hard-coded:
//! they are looked up once through API discovery and handed to the
//! controllers as [`ApiResource`] values. A missing kind is fatal.

use kube::discovery::{ApiResource, Discovery};
use kube::Client;
use tracing::{info, warn};

use crate::Error;

/// Kind name of the worker pool resource
pub const MACHINE_SET_KIND: &str = "MachineSet";

/// Kind name of the compute instance resource
pub const MACHINE_KIND: &str = "Machine";

/// Resolved addressing for both Machine API kinds
#[derive(Clone, Debug)]
pub struct MachineApiResources {
    /// MachineSet resource (e.g. `machinesets`)
    pub machine_set: ApiResource,
    /// Machine resource (e.g. `machines`)
    pub machine: ApiResource,
}

/// Run API discovery for `group` and resolve both kinds at `version`.
pub async fn discover_machine_api(
    client: Client,
    group: &str,
    version: &str,
) -> Result<MachineApiResources, Error> {
    let discovery = Discovery::new(client).filter(&[group]).run().await?;

    let served: Vec<ApiResource> = discovery
        .groups()
        .filter(|g| g.name() == group)
        .flat_map(|g| g.versioned_resources(version))
        .map(|(ar, _caps)| ar)
        .collect();

    if served.is_empty() {
        warn!(group = %group, version = %version, "no resources served for group version");
    }

    let machine_set = select_kind(&served, group, version, MACHINE_SET_KIND)?;
    let machine = select_kind(&served, group, version, MACHINE_KIND)?;

    info!(
        machine_sets = %machine_set.plural,
        machines = %machine.plural,
        api_version = %machine_set.api_version,
        "resolved Machine API resources"
    );

    Ok(MachineApiResources {
        machine_set,
        machine,
    })
}

/// Pick the resource serving `kind` from a discovered list
pub fn select_kind(
    served: &[ApiResource],
    group: &str,
    version: &str,
    kind: &str,
) -> Result<ApiResource, Error> {
    served
        .iter()
        .find(|ar| ar.kind == kind && ar.group == group && ar.version == version)
        .cloned()
        .ok_or_else(|| Error::discovery(format!("{group}/{version}"), kind))
}
