// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the cohort engine.
//!
//! Errors are reserved for conditions the caller must see. Conflicts
//! (duplicate GUIDs, incompatible types, classification clashes) are never
//! errors: they become [`ConflictRecord`](crate::conflict::ConflictRecord)s
//! and the offending write is quarantined.
//!
//! # Error Categories
//!
//! | Error Type | Class | Retryable | Description |
//! |------------|-------|-----------|-------------|
//! | `Connector` | Transient | Yes | Member or local repository connector failed |
//! | `Channel` | Transient | Yes | Event channel publish failed |
//! | `UnknownMember` | Transient | Yes | Member not (yet) registered |
//! | `NoMembersResponded` | Fatal | Yes | Federated query reached nobody |
//! | `MalformedEvent` | Fatal | No | Event cannot be parsed or is inconsistent |
//! | `MemberDeregistered` | Fatal | No | Member is tombstoned |
//! | `QueryCancelled` | Fatal | No | Caller cancelled a federated query |
//! | `InvalidContinuationToken` | Fatal | No | Paging token not produced by this engine |
//! | `Config` | Fatal | No | Configuration invalid |
//! | `InvalidState` | Fatal | No | Engine lifecycle violation |
//! | `Shutdown` | Fatal | No | Engine is shutting down |
//! | `Internal` | Fatal | No | Unexpected internal error |

use crate::federation::MemberWarning;
use thiserror::Error;

/// Result type alias for cohort operations.
pub type Result<T> = std::result::Result<T, CohortError>;

/// Coarse classification used when deciding whether to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Logged and retried or bypassed; never a hard failure for the caller.
    Transient,
    /// Surfaced to the caller as an explicit failure of the operation.
    Fatal,
}

/// Errors that can occur while operating a cohort member.
#[derive(Error, Debug)]
pub enum CohortError {
    /// An inbound event could not be parsed or its kind and payload disagree.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// The referenced member has never registered with this cohort.
    #[error("Unknown member: {member_id}")]
    UnknownMember { member_id: String },

    /// The referenced member has deregistered (terminal).
    #[error("Member deregistered: {member_id}")]
    MemberDeregistered { member_id: String },

    /// A federated query got no response from any member.
    ///
    /// Carries the per-member warnings explaining why each one failed.
    #[error("No members responded ({attempted} attempted)")]
    NoMembersResponded {
        attempted: usize,
        warnings: Vec<MemberWarning>,
    },

    /// The caller cancelled a federated query.
    #[error("Federated query cancelled")]
    QueryCancelled,

    /// A paging token was not produced by this engine.
    #[error("Invalid continuation token: {0}")]
    InvalidContinuationToken(String),

    /// Repository connector failure (local or remote member).
    #[error("Connector error ({member_id}): {message}")]
    Connector { member_id: String, message: String },

    /// Event channel failure.
    #[error("Event channel error: {0}")]
    Channel(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine lifecycle violation (e.g. `start()` twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CohortError {
    /// Create a connector error for a member.
    pub fn connector(member_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connector {
            member_id: member_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connector { .. } => true,
            Self::Channel(_) => true,
            Self::UnknownMember { .. } => true, // registration may still arrive
            Self::NoMembersResponded { .. } => true,
            Self::MalformedEvent(_) => false,
            Self::MemberDeregistered { .. } => false,
            Self::QueryCancelled => false,
            Self::InvalidContinuationToken(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Classify the error per the cohort error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connector { .. } | Self::Channel(_) | Self::UnknownMember { .. } => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<serde_json::Error> for CohortError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedEvent(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_is_transient_and_retryable() {
        let err = CohortError::connector("member-a", "connection refused");
        assert!(err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("member-a"));
    }

    #[test]
    fn test_malformed_event_is_fatal() {
        let err = CohortError::MalformedEvent("missing payload".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_no_members_responded_is_fatal_but_retryable() {
        let err = CohortError::NoMembersResponded {
            attempted: 3,
            warnings: Vec::new(),
        };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("3 attempted"));
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = CohortError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Created"));
        assert!(msg.contains("Running"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_serde_json_error_maps_to_malformed() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: CohortError = parse.unwrap_err().into();
        assert!(matches!(err, CohortError::MalformedEvent(_)));
    }
}
