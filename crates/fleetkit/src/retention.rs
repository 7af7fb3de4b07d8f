//! Retention rotation of backup artifacts.

use crate::error::Result;
use crate::store::ArtifactStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What a rotation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Deleted artifacts, oldest first
    pub deleted: Vec<String>,
    /// Artifacts remaining after rotation
    pub kept: usize,
    /// Deletion that stopped the pass early
    pub failure: Option<String>,
}

impl RetentionReport {
    /// One-line summaries for an operation result.
    pub fn notes(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.deleted.is_empty() {
            notes.push(format!("retention: nothing to rotate ({} kept)", self.kept));
        } else {
            notes.push(format!(
                "retention: deleted {} ({} kept)",
                self.deleted.join(", "),
                self.kept
            ));
        }
        if let Some(failure) = &self.failure {
            notes.push(format!("retention stopped early: {failure}"));
        }
        notes
    }
}

/// Delete artifacts of `environment` older than `now - retention_days`.
///
/// Deletes oldest first and stops at the first failure, which is reported
/// in the result rather than returned. `protect` names an artifact that is
/// never deleted (the one just written).
pub fn rotate(
    store: &dyn ArtifactStore,
    environment: &str,
    retention_days: u32,
    now: DateTime<Utc>,
    protect: Option<&str>,
) -> Result<RetentionReport> {
    let cutoff = now - Duration::days(i64::from(retention_days));
    let artifacts = store.list(environment)?;
    let mut report = RetentionReport {
        kept: artifacts.len(),
        ..RetentionReport::default()
    };

    for artifact in artifacts
        .iter()
        .filter(|a| a.timestamp < cutoff && Some(a.file_name.as_str()) != protect)
    {
        match store.delete(artifact) {
            Ok(()) => {
                log::info!("Rotated out {}", artifact.file_name);
                report.deleted.push(artifact.file_name.clone());
                report.kept -= 1;
            }
            Err(e) => {
                log::warn!("Failed to delete {}: {}", artifact.file_name, e);
                report.failure = Some(format!("{}: {e}", artifact.file_name));
                break;
            }
        }
    }

    Ok(report)
}
