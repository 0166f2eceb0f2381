//! Runtime configuration shared by the reconcilers

use std::time::Duration;

use crate::retry::RetryConfig;
use crate::{MACHINE_API_GROUP, MACHINE_API_VERSION, MACHINE_API_NAMESPACE};

/// Controller tuning resolved from flags/environment at startup
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// API group serving MachineSet and Machine
    pub api_group: String,
    /// API version of both kinds
    pub api_version: String,
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Minimum time a guarded scale-down stays deferred before it is finalized
    pub scale_down_settle_period: Duration,
    /// Backoff for the fetch-decide-write sequence on version conflicts and
    /// transient store errors
    pub store_retry: RetryConfig,
    /// Requeue interval for steady-state MachineSets
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            api_group: MACHINE_API_GROUP.to_string(),
            api_version: MACHINE_API_VERSION.to_string(),
            namespace: Some(MACHINE_API_NAMESPACE.to_string()),
            scale_down_settle_period: Duration::from_secs(15),
            store_retry: RetryConfig::default(),
            resync_interval: Duration::from_secs(300),
        }
    }
}

impl ControllerConfig {
    /// Delay before a deferred scale-down is looked at again
    ///
    /// Never zero so a deferral always costs at least one re-queued pass.
    pub fn defer_requeue(&self) -> Duration {
        self.scale_down_settle_period.max(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_target_openshift_machine_api() {
        let config = ControllerConfig::default();
        assert_eq!(config.api_group, "machine.openshift.io");
        assert_eq!(config.api_version, "v1beta1");
        assert_eq!(config.namespace.as_deref(), Some("openshift-machine-api"));
    }

    #[test]
    fn test_defer_requeue_is_never_zero() {
        let config = ControllerConfig {
            scale_down_settle_period: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.defer_requeue(), Duration::from_secs(1));

        let config = ControllerConfig::default();
        assert_eq!(config.defer_requeue(), Duration::from_secs(15));
    }
}
