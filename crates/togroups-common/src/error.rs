//! Error types for the togroups operator
//!
//! Errors carry the policy or provider they relate to so that a failed
//! derivation can be traced back to its source from the logs alone.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Requeue delay for transient failures
pub const FAST_REQUEUE: Duration = Duration::from_secs(30);

/// Main error type for togroups operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither a conflict nor an outage
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// No provider is registered for the group's provider kind
    #[error("no provider registered for group kind {kind}")]
    UnknownProvider {
        /// Provider kind named by the group reference (e.g. "aws")
        kind: String,
    },

    /// A provider failed, timed out, or was cancelled while resolving a group
    #[error("group resolution failed [{kind}]: {message}")]
    ProviderResolution {
        /// Provider kind that was invoked
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// The source policy cannot be turned into a derivative
    #[error("cannot derive policy {policy}: {message}")]
    PolicyDerivation {
        /// Source policy (namespace/name or name)
        policy: String,
        /// Description of the structural problem
        message: String,
    },

    /// Optimistic concurrency failure writing a derivative
    #[error("conflict writing {name}: object changed since it was read")]
    StoreConflict {
        /// Name of the object that conflicted
        name: String,
    },

    /// The object store is temporarily unreachable
    #[error("policy store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// An operation ran past its deadline
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// Operation that timed out (e.g. "reconcile")
        operation: String,
        /// Deadline that was exceeded
        after: Duration,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "resolver", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create an unknown-provider error for the given kind
    pub fn unknown_provider(kind: impl Into<String>) -> Self {
        Self::UnknownProvider { kind: kind.into() }
    }

    /// Create a resolution error for the given provider kind
    pub fn resolution(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProviderResolution {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a derivation error without policy context
    ///
    /// Use [`Error::in_policy`] to attach the policy once it is known.
    pub fn policy_derivation(msg: impl Into<String>) -> Self {
        Self::PolicyDerivation {
            policy: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a derivation error for a specific policy
    pub fn policy_derivation_for(policy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PolicyDerivation {
            policy: policy.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube error from a store write or read
    ///
    /// - 409 Conflict becomes [`Error::StoreConflict`]
    /// - 429 and 5xx responses, and transport failures, become [`Error::StoreUnavailable`]
    /// - everything else stays a [`Error::Kube`]
    pub fn from_store(name: impl Into<String>, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 409 => Self::StoreConflict { name: name.into() },
            kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => Self::StoreUnavailable {
                message: err.to_string(),
            },
            kube::Error::Api(_) => Self::Kube { source: err },
            kube::Error::SerdeError(e) => Self::serialization(e.to_string()),
            _ => Self::StoreUnavailable {
                message: err.to_string(),
            },
        }
    }

    /// Attach policy context to a derivation error
    ///
    /// Other variants are returned unchanged.
    pub fn in_policy(self, policy: &str) -> Self {
        match self {
            Self::PolicyDerivation { message, .. } => Self::PolicyDerivation {
                policy: policy.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Check if this error is retryable
    ///
    /// Derivation and serialization errors need the source policy to change
    /// and only get picked up again by the periodic refresh. Resolution and
    /// store errors are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, forbidden, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::UnknownProvider { .. } => true,
            Error::ProviderResolution { .. } => true,
            Error::PolicyDerivation { .. } => false,
            Error::StoreConflict { .. } => true,
            Error::StoreUnavailable { .. } => true,
            Error::Serialization { .. } => false,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// How long the controller waits before retrying after this error
    ///
    /// Transient errors come back quickly; everything else waits for the
    /// slow cadence so a broken policy is not hammered.
    pub fn requeue_after(&self, slow: Duration) -> Duration {
        if self.is_retryable() {
            FAST_REQUEUE.min(slow)
        } else {
            slow
        }
    }

    /// True for optimistic-concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::StoreConflict { .. })
    }

    /// True when the store could not be reached
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable { .. })
    }

    /// Get the policy name if this error is associated with a specific policy
    pub fn policy(&self) -> Option<&str> {
        match self {
            Error::PolicyDerivation { policy, .. } => Some(policy),
            _ => None,
        }
    }

    /// Short, stable label for metrics
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::UnknownProvider { .. } => "unknown_provider",
            Error::ProviderResolution { .. } => "resolution",
            Error::PolicyDerivation { .. } => "derivation",
            Error::StoreConflict { .. } => "conflict",
            Error::StoreUnavailable { .. } => "unavailable",
            Error::Serialization { .. } => "serialization",
            Error::Timeout { .. } => "timeout",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: How failures are classified during derivation
    // ==========================================================================

    /// Story: a policy referencing a provider nobody registered
    ///
    /// The operator may start before a provider is wired in; the error names
    /// the missing kind and the policy is retried later.
    #[test]
    fn story_unknown_provider_is_retried() {
        let err = Error::unknown_provider("aws");
        assert!(err.to_string().contains("aws"));
        assert!(err.is_retryable());
        assert_eq!(err.kind_label(), "unknown_provider");
    }

    /// Story: structural policy problems wait for the refresh cadence
    #[test]
    fn story_derivation_errors_carry_policy_context() {
        let err = Error::policy_derivation("toGroups entry names no provider");
        assert_eq!(err.policy(), Some(UNKNOWN_CONTEXT));

        let err = err.in_policy("testns/test");
        assert_eq!(err.policy(), Some("testns/test"));
        assert!(err.to_string().contains("testns/test"));
        assert!(err.to_string().contains("names no provider"));
        assert!(!err.is_retryable());
    }

    /// Story: in_policy leaves unrelated errors alone
    #[test]
    fn story_in_policy_only_touches_derivation_errors() {
        let err = Error::resolution("aws", "throttled").in_policy("p");
        match err {
            Error::ProviderResolution { kind, message } => {
                assert_eq!(kind, "aws");
                assert_eq!(message, "throttled");
            }
            other => panic!("expected ProviderResolution, got {other:?}"),
        }
    }

    /// Story: store errors are sorted into conflict, outage, and hard failure
    #[test]
    fn story_store_errors_are_classified_by_status() {
        let err = Error::from_store("test-togroups-123", api_error(409));
        assert!(err.is_conflict());
        assert!(err.to_string().contains("test-togroups-123"));

        let err = Error::from_store("x", api_error(503));
        assert!(err.is_unavailable());
        assert!(err.is_retryable());

        let err = Error::from_store("x", api_error(429));
        assert!(err.is_unavailable());

        let err = Error::from_store("x", api_error(403));
        assert!(matches!(err, Error::Kube { .. }));
        assert!(!err.is_retryable());
    }

    /// Story: a reconcile that runs past its deadline reports how long it had
    #[test]
    fn story_timeout_reports_deadline() {
        let err = Error::timeout("reconcile", Duration::from_secs(60));
        assert_eq!(err.to_string(), "reconcile timed out after 60s");
        assert!(err.is_retryable());
    }

    /// Story: broken policies wait for the refresh, outages come back soon
    #[test]
    fn story_requeue_cadence_follows_retryability() {
        let slow = Duration::from_secs(300);
        assert_eq!(Error::resolution("aws", "x").requeue_after(slow), FAST_REQUEUE);
        assert_eq!(Error::policy_derivation("x").requeue_after(slow), slow);
        // never later than the refresh itself
        let fast = Duration::from_secs(5);
        assert_eq!(Error::timeout("reconcile", fast).requeue_after(fast), fast);
    }

    #[test]
    fn kube_5xx_is_retryable_4xx_is_not() {
        let err: Error = api_error(500).into();
        assert!(err.is_retryable());
        let err: Error = api_error(404).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }
}
