//! Operation requests.

use crate::outcome::OperationName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Explicit acknowledgment for a destructive action.
///
/// A token never comes from a default; the caller constructs one on
/// purpose. To confirm a destructive restore it must spell out the name of
/// the environment being overwritten.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Whether this token acknowledges destroying data in `environment`.
    pub fn confirms(&self, environment: &str) -> bool {
        !self.0.is_empty() && self.0 == environment
    }
}

impl fmt::Debug for ConfirmationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfirmationToken({:?})", self.0)
    }
}

/// Options for a restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Artifact file name, path, or `latest`
    pub artifact: String,
    /// Restore only this database
    pub database_filter: Option<String>,
    /// Drop the existing data before restoring
    pub drop_existing: bool,
    /// Restore onto this node instead of the bootstrap primary
    pub target: Option<String>,
    /// Required when `drop_existing` is set
    pub confirmation: Option<ConfirmationToken>,
}

/// What to do with an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationKind {
    /// Converge the fleet onto its desired configuration
    Deploy {
        /// Compute actions without applying them
        dry_run: bool,
    },
    /// Take a consistent backup
    Backup,
    /// Restore from a backup artifact
    Restore(RestoreOptions),
    /// Produce a read-only status report
    Maintenance,
}

impl OperationKind {
    pub fn name(&self) -> OperationName {
        match self {
            Self::Deploy { .. } => OperationName::Deploy,
            Self::Backup => OperationName::Backup,
            Self::Restore(_) => OperationName::Restore,
            Self::Maintenance => OperationName::Maintenance,
        }
    }
}

/// A request against one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Environment name
    pub environment: String,
    /// Operation
    pub kind: OperationKind,
}

impl OperationRequest {
    pub fn new(environment: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            environment: environment.into(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_must_name_environment() {
        let token = ConfirmationToken::new("staging");
        assert!(token.confirms("staging"));
        assert!(!token.confirms("production"));
        assert!(!ConfirmationToken::new("").confirms(""));
    }

    #[test]
    fn test_default_restore_options_carry_no_token() {
        let opts = RestoreOptions::default();
        assert!(opts.confirmation.is_none());
        assert!(!opts.drop_existing);
    }
}
