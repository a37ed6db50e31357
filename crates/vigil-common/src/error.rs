//! Error types for the vigil operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to pick a requeue strategy:
//! validation errors wait for a spec change, transient API errors requeue.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for vigil operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a user-authored resource
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.override.clusterAgent.replicas")
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

    /// One or more features failed to mutate a component's pod template
    #[error("feature mutation failed for {component}: {message}")]
    FeatureMutation {
        /// Component whose template was being built
        component: String,
        /// Aggregated per-feature messages
        message: String,
    },

    /// One or more dependency objects could not be managed
    #[error("dependency errors: {}", messages.join("; "))]
    Dependencies {
        /// Every failure collected during the pass
        messages: Vec<String>,
        /// Whether any of the collected failures is transient
        retryable: bool,
    },

    /// Profile validation or assignment error
    #[error("profile error for {profile}: {message}")]
    Profile {
        /// `namespace/name` of the profile
        profile: String,
        /// Description of what failed
        message: String,
    },

    /// Canary-capable rollout object is in an unexpected state
    #[error("canary error for {workload}: {message}")]
    Canary {
        /// Name of the extended daemonset being inspected
        workload: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "store", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource and field path
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

    /// Create a feature mutation error for a component
    pub fn feature_mutation(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::FeatureMutation {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Aggregate several errors into a single dependency error.
    ///
    /// Returns `None` when the input is empty.
    pub fn dependencies(errors: Vec<Error>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let retryable = errors.iter().any(Error::is_retryable);
        Some(Self::Dependencies {
            messages: errors.iter().map(ToString::to_string).collect(),
            retryable,
        })
    }

    /// Create a profile error
    pub fn profile(profile: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Profile {
            profile: profile.into(),
            message: msg.into(),
        }
    }

    /// Create a canary error
    pub fn canary(workload: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Canary {
            workload: workload.into(),
            message: msg.into(),
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

    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// Check if this error is a resource-version conflict
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Check if this error is a not-found response
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Check if the component loop must stop and the reconcile requeue now.
    ///
    /// Permission errors, conflicts and rate limiting leave the remaining
    /// components working from stale state, so they short-circuit the pass.
    pub fn requires_immediate_requeue(&self) -> bool {
        matches!(self.api_code(), Some(403) | Some(409) | Some(429))
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and feature mutation errors need a spec
    /// change. Kubernetes errors are retryable except for 4xx responses,
    /// with conflicts and rate limiting treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    matches!(ae.code, 409 | 429) || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::FeatureMutation { .. } => false,
            Error::Dependencies { retryable, .. } => *retryable,
            Error::Profile { .. } => false,
            Error::Canary { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} error", reason),
            reason: reason.to_string(),
            code,
        }),
    }
}
