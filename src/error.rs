//! Error types for the MachineSet sync controller
//!
//! Malformed or partially populated resources are never errors here: the
//! classifier degrades to `false` instead. Errors are reserved for the store
//! interaction, startup discovery and process plumbing.

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource kind could not be resolved through API discovery
    #[error("discovery error: kind {kind} not served by {group_version}")]
    Discovery {
        /// Group/version that was searched (e.g. "machine.openshift.io/v1beta1")
        group_version: String,
        /// Kind that could not be found
        kind: String,
    },

    /// Optimistic concurrency retries were exhausted
    #[error("update conflict on {object} after {attempts} attempts")]
    Conflict {
        /// namespace/name of the object being written
        object: String,
        /// Number of fetch-decide-write attempts made
        attempts: u32,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "health", "trigger", "leader-election")
        context: String,
    },
}

impl Error {
    /// Create a discovery error for a group/version and kind
    pub fn discovery(group_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::Discovery {
            group_version: group_version.into(),
            kind: kind.into(),
        }
    }

    /// Create a conflict error for an object key
    pub fn conflict(object: impl Into<String>, attempts: u32) -> Self {
        Self::Conflict {
            object: object.into(),
            attempts,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the store rejected a write because the object changed since it was read
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Store errors are retryable unless they are 4xx responses other than
    /// 409 Conflict. Discovery and serialization errors need an operator fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Discovery { .. } => false,
            Error::Conflict { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Short, stable label for metrics
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::Kube { .. } if self.is_conflict() => "conflict",
            Error::Kube { .. } => "kube",
            Error::Discovery { .. } => "discovery",
            Error::Conflict { .. } => "conflict_exhausted",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} for test"),
            reason: reason.to_string(),
            code,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_detected_and_retryable() {
        let err = api_error(409, "Conflict");
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert_eq!(err.kind_label(), "conflict");
    }

    #[test]
    fn test_client_errors_other_than_conflict_are_permanent() {
        let err = api_error(422, "Invalid");
        assert!(!err.is_conflict());
        assert!(!err.is_retryable());

        let err = api_error(404, "NotFound");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_server_errors_are_retryable() {
        let err = api_error(503, "ServiceUnavailable");
        assert!(err.is_retryable());
        assert_eq!(err.kind_label(), "kube");
    }

    #[test]
    fn test_discovery_errors_name_the_missing_kind() {
        let err = Error::discovery("machine.openshift.io/v1beta1", "MachineSet");
        assert!(err.to_string().contains("MachineSet"));
        assert!(err.to_string().contains("machine.openshift.io/v1beta1"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_exhausted_conflicts_report_attempts() {
        let err = Error::conflict("openshift-machine-api/worker-a", 5);
        assert!(err.to_string().contains("worker-a"));
        assert!(err.to_string().contains("5 attempts"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_internal_errors_carry_context() {
        let err = Error::internal_with_context("health", "bind failed");
        assert!(err.to_string().contains("[health]"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_serialization_errors_keep_kind() {
        match Error::serialization_for_kind("MachineSet", "metadata missing") {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("MachineSet")),
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!Error::serialization_for_kind("MachineSet", "x").is_retryable());
    }
}
