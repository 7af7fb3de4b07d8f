//! Error types for fleet operations.
//!
//! Errors are categorized so that the retry logic can tell transient
//! transport failures apart from failures that must surface immediately,
//! and so that callers can tell operation-level preconditions (which abort
//! before any side effect) apart from per-node failures.

use std::time::Duration;
use thiserror::Error;

/// Remote exit codes treated as transient.
///
/// 75 is `EX_TEMPFAIL`; 124 is what `timeout(1)` reports when the wrapped
/// command overran its budget on the remote side.
pub const TRANSIENT_EXIT_CODES: &[i32] = &[75, 124];

/// Categories of fleet errors for retry and exit-status logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unknown environment, node, artifact, or database
    NotFound,
    /// Connection-level failure, worth retrying
    Transient,
    /// Credentials rejected
    Auth,
    /// Remote command exited with a failure code
    Remote,
    /// Backup artifact failed validation
    Artifact,
    /// Destructive action attempted without confirmation
    Safety,
    /// A bounded wait was exceeded
    Timeout,
    /// Requested change is not allowed (e.g. downgrade)
    Precondition,
    /// Caller cancelled the operation
    Cancelled,
    /// Local IO / serialization failure
    Local,
}

impl ErrorCategory {
    /// Whether the whole operation must abort before any side effect.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::Artifact | Self::Safety | Self::Precondition
        )
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotFound => "Not found",
            Self::Transient => "Node unreachable",
            Self::Auth => "Authentication failed",
            Self::Remote => "Remote command failed",
            Self::Artifact => "Invalid backup artifact",
            Self::Safety => "Confirmation required",
            Self::Timeout => "Timed out",
            Self::Precondition => "Precondition failed",
            Self::Cancelled => "Cancelled",
            Self::Local => "Local error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::NotFound => "Check the environment name, node id, or artifact reference",
            Self::Transient => "Check network connectivity and SSH access to the node",
            Self::Auth => "Verify the credential reference resolves to the right secret",
            Self::Remote => "Inspect the remote stderr shown above",
            Self::Artifact => "Pick another artifact; this one is corrupt or incomplete",
            Self::Safety => "Pass the environment name as the confirmation token",
            Self::Timeout => "Check the primary's health and raise the barrier timeout if needed",
            Self::Precondition => "Adjust the desired configuration",
            Self::Cancelled => "Re-run the operation; applied changes were kept",
            Self::Local => "Check local disk space and permissions",
        }
    }
}

/// Errors that can occur during fleet operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown environment, artifact, node, or database reference
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// Node could not be reached (connect failure or call timeout)
    #[error("{node} unreachable: {message}")]
    Unreachable {
        /// Node id
        node: String,
        /// Transport-level detail
        message: String,
    },

    /// Credentials were rejected
    #[error("authentication failed on {node}: {message}")]
    AuthFailed {
        /// Node id
        node: String,
        /// Detail reported by the remote side
        message: String,
    },

    /// Remote command exited non-zero
    #[error("remote command failed on {node} (exit {code}): {stderr}")]
    RemoteError {
        /// Node id
        node: String,
        /// Exit code of the remote command
        code: i32,
        /// Standard error of the remote command
        stderr: String,
    },

    /// Backup artifact is missing, truncated, or fails its checksum
    #[error("artifact {artifact} is invalid: {reason}")]
    ArtifactInvalid {
        /// Artifact file name
        artifact: String,
        /// Why validation failed
        reason: String,
    },

    /// Destructive option used without an explicit confirmation token
    #[error("confirmation required: {message}")]
    ConfirmationRequired {
        /// What needs confirming
        message: String,
    },

    /// A bounded wait ran out
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// How long we waited
        waited: Duration,
    },

    /// The request cannot be carried out as declared
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the violated precondition
        message: String,
    },

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Inventory or settings file failed to parse or validate
    #[error("invalid configuration in {path}: {message}")]
    Config {
        /// File that was being loaded
        path: String,
        /// Parser or validation message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::Unreachable { .. } => ErrorCategory::Transient,
            Error::AuthFailed { .. } => ErrorCategory::Auth,
            Error::RemoteError { .. } => ErrorCategory::Remote,
            Error::ArtifactInvalid { .. } => ErrorCategory::Artifact,
            Error::ConfirmationRequired { .. } => ErrorCategory::Safety,
            Error::Timeout { .. } => ErrorCategory::Timeout,
            Error::PreconditionFailed { .. } | Error::Config { .. } => ErrorCategory::Precondition,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::Io(_) | Error::Json(_) | Error::Other(_) => ErrorCategory::Local,
        }
    }

    /// Whether this error is transient and worth retrying.
    ///
    /// `Unreachable` always is; `RemoteError` only for codes listed in
    /// [`TRANSIENT_EXIT_CODES`]. Everything else fails on first sight.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Unreachable { .. } => true,
            Error::RemoteError { code, .. } => TRANSIENT_EXIT_CODES.contains(code),
            _ => false,
        }
    }

    /// Shorthand for a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Shorthand for a precondition failure.
    pub fn precondition(message: impl Into<String>) -> Self {
        Error::PreconditionFailed {
            message: message.into(),
        }
    }

    /// Shorthand for an unreachable node.
    pub fn unreachable(node: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Unreachable {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// Result type for fleet operations.
pub type Result<T> = std::result::Result<T, Error>;
