//! Ledger records and run reporting types
//!
//! `MigrationRecord` mirrors a row of the history table; the outcome and
//! summary types are what `migrate`/`rollback`/`get_migration_status`
//! return to callers (and what an HTTP layer would serialize directly).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a migration in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Applied => "applied",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MigrationStatus::Pending),
            "applied" => Ok(MigrationStatus::Applied),
            "failed" => Ok(MigrationStatus::Failed),
            "rolled_back" => Ok(MigrationStatus::RolledBack),
            other => Err(format!("unknown migration status: {}", other)),
        }
    }
}

/// A persisted row of the migration history table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub status: MigrationStatus,
    pub checksum: Option<String>,
    /// Wall-clock execution time of the up SQL, in seconds
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
    /// Snapshot of the down SQL at apply time, so rollback stays correct
    /// even if the source changes afterwards
    pub rollback_sql: Option<String>,
}

/// Per-migration result of a `migrate` or `rollback` run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub version: String,
    pub name: String,
    pub status: MigrationStatus,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
}

/// Identity of a not-yet-applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigration {
    pub version: String,
    pub name: String,
}

/// Snapshot of ledger state, freshly read on every call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStatusSummary {
    pub applied_count: usize,
    pub pending_count: usize,
    pub failed_count: usize,
    pub pending: Vec<PendingMigration>,
    /// Applied versions whose source checksum no longer matches the ledger
    pub drifted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for status in [
            MigrationStatus::Pending,
            MigrationStatus::Applied,
            MigrationStatus::Failed,
            MigrationStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<MigrationStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<MigrationStatus>().is_err());
    }

    #[test]
    fn status_serializes_in_snake_case() {
        let json = serde_json::to_string(&MigrationStatus::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
    }

    #[test]
    fn summary_serializes_for_api_consumers() {
        let summary = MigrationStatusSummary {
            applied_count: 1,
            pending_count: 1,
            failed_count: 0,
            pending: vec![PendingMigration {
                version: "20240101_120000".to_string(),
                name: "add_email".to_string(),
            }],
            drifted: Vec::new(),
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["applied_count"], 1);
        assert_eq!(json["pending"][0]["version"], "20240101_120000");
    }
}
