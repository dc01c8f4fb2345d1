//! Error types for a3s-kyc

use crate::types::{ProviderKind, VerificationLevel};
use thiserror::Error;

/// Errors that can occur in the verification lifecycle
#[derive(Debug, Error)]
pub enum KycError {
    /// Malformed request (level NONE start, unsupported webhook resource, illegal transition)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown record or user
    #[error("Not found: {0}")]
    NotFound(String),

    /// Prerequisite not met
    #[error("Policy violation: {0}")]
    Policy(String),

    /// Monthly limit exceeded for the user's active level
    #[error("Monthly limit exceeded at level {level}: usage {usage} + requested {requested} > limit {limit}")]
    LimitExceeded {
        level: VerificationLevel,
        limit: f64,
        usage: f64,
        requested: f64,
    },

    /// Invalid or stale webhook signature
    ///
    /// Deliberately carries no detail about which check failed.
    #[error("Invalid webhook signature")]
    Signature,

    /// Upstream provider call failed
    #[error("Provider {provider} returned {status}: {message}")]
    Provider {
        provider: ProviderKind,
        status: u16,
        message: String,
    },

    /// Provider call exceeded its time bound
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Persistence backend failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Optimistic concurrency check failed on update
    #[error("Version conflict on record '{id}': expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// A PENDING record already exists for (user, level)
    #[error("Pending verification already exists for user '{user_id}' at level {level}")]
    DuplicatePending {
        user_id: String,
        level: VerificationLevel,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KycError {
    /// True for every policy rejection, including limit overruns
    pub fn is_policy(&self) -> bool {
        matches!(self, KycError::Policy(_) | KycError::LimitExceeded { .. })
    }

    /// True for upstream failures (non-2xx responses and timeouts)
    pub fn is_provider(&self) -> bool {
        matches!(self, KycError::Provider { .. } | KycError::Timeout(_))
    }
}

/// Result type alias for verification operations
pub type Result<T> = std::result::Result<T, KycError>;
