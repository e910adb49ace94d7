//! Error types for the simulated node agent
//!
//! Errors are structured with fields to aid debugging at scale. Each variant
//! carries the node, address or resource kind it concerns so a log line is
//! enough to locate the failing synthetic object.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kubesim operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration or object content
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "nodeCount")
        field: Option<String>,
    },

    /// Pod CIDR that cannot back an address pool
    #[error("invalid pod CIDR {cidr}: {message}")]
    InvalidCidr {
        /// The CIDR as declared on the node
        cidr: String,
        /// Why it was rejected
        message: String,
    },

    /// Address handed back to a pool it does not belong to, or malformed
    #[error("invalid address {address}: {message}")]
    InvalidAddress {
        /// The address as received
        address: String,
        /// Why it was rejected
        message: String,
    },

    /// No identifiers left in a node's address pool
    #[error("address pool {prefix}.0 exhausted after {capacity} addresses")]
    PoolExhausted {
        /// First three octets of the pool
        prefix: String,
        /// Number of identifiers the pool holds
        capacity: u16,
    },

    /// Watch stream failure for a resource kind
    #[error("watch error [{kind}]: {message}")]
    Watch {
        /// Resource kind being watched (Node, Pod)
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Shutdown was requested while an operation was in flight
    #[error("cancelled [{context}]")]
    Cancelled {
        /// Component that observed the cancellation
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "dispatch", "lifecycle")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid CIDR error
    pub fn invalid_cidr(cidr: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidCidr {
            cidr: cidr.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid address error
    pub fn invalid_address(address: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            message: msg.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(prefix: impl Into<String>, capacity: u16) -> Self {
        Self::PoolExhausted {
            prefix: prefix.into(),
            capacity,
        }
    }

    /// Create a watch error for a resource kind
    pub fn watch(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Watch {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error for a component
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Invalid input never heals on its own. Transient API failures and
    /// watch failures do; the next tick or event is the retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::InvalidCidr { .. } => false,
            Error::InvalidAddress { .. } => false,
            Error::PoolExhausted { .. } => true,
            Error::Watch { .. } => true,
            Error::Cancelled { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when this is the shutdown signal rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// True when the Kubernetes API answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True when the Kubernetes API answered 409, including failed preconditions
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: a node declaring an IPv6 pod CIDR is rejected with the CIDR in the message
    #[test]
    fn story_invalid_cidr_names_the_cidr() {
        let err = Error::invalid_cidr("2001:db8::/64", "must be IPv4");
        assert!(err.to_string().contains("2001:db8::/64"));
        assert!(err.to_string().contains("must be IPv4"));
        assert!(!err.is_retryable());
    }

    /// Story: releasing a foreign address is a caller bug, never retried
    #[test]
    fn story_invalid_address_is_permanent() {
        let err = Error::invalid_address("10.0.0.7", "does not belong to 10.244.1");
        assert!(err.to_string().contains("10.0.0.7"));
        assert!(!err.is_retryable());
    }

    /// Story: an exhausted pool frees up once pods are removed
    #[test]
    fn story_pool_exhaustion_is_retryable() {
        let err = Error::pool_exhausted("10.244.1", 254);
        assert!(err.to_string().contains("10.244.1.0"));
        assert!(err.to_string().contains("254"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_for_field() {
        let err = Error::validation_for_field("nodeCount", "must be between 1 and 254");
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("nodeCount")),
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kube_error_retryability() {
        assert!(!api_error(404).is_retryable());
        assert!(!api_error(409).is_retryable());
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::internal("x").is_not_found());
    }

    #[test]
    fn test_conflict_detection() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(404).is_conflict());
        assert!(!Error::watch("Pod", "gone").is_conflict());
    }

    #[test]
    fn test_cancelled() {
        let err = Error::cancelled("dispatch");
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("[dispatch]"));
    }

    #[test]
    fn test_watch_error_message() {
        let err = Error::watch("Pod", "stream ended");
        assert!(err.to_string().contains("[Pod]"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        let err = Error::internal_with_context("lifecycle", "unexpected state");
        assert!(err.to_string().contains("[lifecycle]"));
    }
}
