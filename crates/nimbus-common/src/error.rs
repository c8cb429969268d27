//! Error types for the Nimbus controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like resource
//! names and underlying causes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Nimbus operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.selector")
        field: Option<String>,
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
        /// Context where the error occurred (e.g., "reconciler", "watch")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without resource context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
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

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
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
    /// Validation and serialization errors are not retryable (require a
    /// spec fix; the update event re-enqueues the parent). Kubernetes
    /// errors depend on the status code: 4xx responses won't get better
    /// on retry, with the exception of 409 Conflict, which is the normal
    /// outcome of racing writers and must be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error is a Kubernetes 404 response
    ///
    /// Used by the adoption manager: a patch or delete against a child
    /// that is already gone is not a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found() -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "virtualmachineinstances \"vm-a\" not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            }),
        }
    }

    fn conflict() -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            }),
        }
    }

    /// Story: spec validation catches misconfigurations before any child
    /// is created
    ///
    /// When a user writes a VirtualMachineDefinition whose selector does
    /// not match its template labels, the controller must reject it with
    /// a clear message and must not retry until the spec changes.
    #[test]
    fn story_validation_prevents_reconciliation_of_invalid_specs() {
        let err = Error::validation_for("vm-a", "selector does not match template labels");
        assert!(err.to_string().contains("vm-a"));
        assert!(err.to_string().contains("selector does not match"));
        assert!(!err.is_retryable());
        assert_eq!(err.resource(), Some("vm-a"));

        let err = Error::validation_for_field("vm-a", "spec.selector", "invalid requirement");
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.selector"));
            }
            _ => panic!("expected Validation variant"),
        }
    }

    /// Story: API errors requeue with backoff, except terminal 4xx codes
    #[test]
    fn story_kube_error_retryability_by_status_code() {
        // 404: the object is gone; retrying won't bring it back
        assert!(!not_found().is_retryable());
        assert!(not_found().is_not_found());

        // 409: racing writers, retry resolves it
        assert!(conflict().is_retryable());
        assert!(!conflict().is_not_found());
    }

    #[test]
    fn test_internal_error_context() {
        let err = Error::internal_with_context("reconciler", "unexpected state");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[reconciler]"));
        assert!(err.to_string().contains("unexpected state"));

        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains(&format!("[{UNKNOWN_CONTEXT}]")));
    }

    #[test]
    fn test_serialization_error_is_permanent() {
        let err = Error::serialization_for_kind("VirtualMachineInstance", "missing field");
        assert!(!err.is_retryable());
        match &err {
            Error::Serialization { kind, .. } => {
                assert_eq!(kind.as_deref(), Some("VirtualMachineInstance"));
            }
            _ => panic!("expected Serialization variant"),
        }
    }

    #[test]
    fn test_error_construction_ergonomics() {
        let name = "vm-prod";
        let err = Error::validation(format!("definition {} has no template", name));
        assert!(err.to_string().contains("vm-prod"));

        let err = Error::internal("static message");
        assert!(err.to_string().contains("static message"));
    }
}
