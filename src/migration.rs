//! Migration value entity
//!
//! A migration is an immutable `(version, name, up_sql, down_sql)` tuple.
//! Versions use the fixed-width `YYYYMMDD_HHMMSS` format, so lexicographic
//! order is chronological order.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Format string for migration version stamps
pub const VERSION_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Represents a database migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Sortable timestamp version (`YYYYMMDD_HHMMSS`), globally unique
    pub version: String,
    /// Human-readable name, not required to be unique
    pub name: String,
    /// SQL statements to apply the migration
    pub up_sql: String,
    /// SQL statements to reverse the migration
    pub down_sql: String,
}

impl Migration {
    /// Create a migration with empty up/down SQL
    pub fn new(version: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            up_sql: String::new(),
            down_sql: String::new(),
        }
    }

    /// Create a migration with up and down SQL
    pub fn with_sql(
        version: impl Into<String>,
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: down_sql.into(),
        }
    }

    /// Forward SQL (empty string when unset)
    pub fn up(&self) -> &str {
        &self.up_sql
    }

    /// Reverse SQL (empty string when unset)
    pub fn down(&self) -> &str {
        &self.down_sql
    }

    /// Deterministic SHA-256 digest over (version, name, up_sql, down_sql).
    ///
    /// Fields are separated by a zero byte so that content cannot shift
    /// between fields without changing the digest.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [&self.version, &self.name, &self.up_sql, &self.down_sql] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Render a UTC timestamp as a version stamp
pub fn version_stamp(at: DateTime<Utc>) -> String {
    at.format(VERSION_FORMAT).to_string()
}

/// Parse a version stamp back into a timestamp; `None` when malformed
pub fn parse_version(version: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(version, VERSION_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn checksum_is_deterministic() {
        let migration = Migration::with_sql(
            "20240101_120000",
            "create_users",
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
            "DROP TABLE users;",
        );

        let first = migration.checksum();
        let second = migration.checksum();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn checksum_changes_with_any_field() {
        let base = Migration::with_sql("20240101_120000", "base", "CREATE TABLE a (id INT);", "DROP TABLE a;");

        let variants = [
            Migration::with_sql("20240101_120001", "base", "CREATE TABLE a (id INT);", "DROP TABLE a;"),
            Migration::with_sql("20240101_120000", "other", "CREATE TABLE a (id INT);", "DROP TABLE a;"),
            Migration::with_sql("20240101_120000", "base", "CREATE TABLE b (id INT);", "DROP TABLE a;"),
            Migration::with_sql("20240101_120000", "base", "CREATE TABLE a (id INT);", "DROP TABLE b;"),
        ];

        for variant in &variants {
            assert_ne!(base.checksum(), variant.checksum());
        }
    }

    #[test]
    fn checksum_does_not_shift_between_fields() {
        // Same concatenated bytes, different field boundaries.
        let left = Migration::with_sql("20240101_120000", "ab", "c", "");
        let right = Migration::with_sql("20240101_120000", "a", "bc", "");
        assert_ne!(left.checksum(), right.checksum());
    }

    #[test]
    fn empty_sql_is_allowed() {
        let migration = Migration::new("20240101_120000", "empty");
        assert_eq!(migration.up(), "");
        assert_eq!(migration.down(), "");
        assert!(!migration.checksum().is_empty());
    }

    #[test]
    fn version_order_is_chronological() {
        // Spans a year boundary and a leap day.
        let mut migrations = vec![
            Migration::new("20240229_000000", "leap_day"),
            Migration::new("20231231_235959", "year_end"),
            Migration::new("20240101_000000", "year_start"),
            Migration::new("20240301_120000", "after_leap"),
        ];

        migrations.sort_by(|a, b| a.version.cmp(&b.version));

        let names: Vec<&str> = migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["year_end", "year_start", "leap_day", "after_leap"]);
    }

    #[test]
    fn version_stamp_round_trips() {
        let at = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 58).unwrap();
        let stamp = version_stamp(at);

        assert_eq!(stamp, "20240229_235958");
        assert_eq!(stamp.len(), 15);
        assert_eq!(parse_version(&stamp), Some(at.naive_utc()));
        assert_eq!(parse_version("not_a_version"), None);
    }
}
