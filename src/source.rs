//! Migration sources
//!
//! A source enumerates all known migrations in stable version order and
//! persists newly created ones. `FileSource` reads a directory of
//! `<version>_<name>.sql` files with `-- up` / `-- down` section markers;
//! `MemorySource` is a programmatic registry.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{MigrationError, MigrationResult};
use crate::migration::Migration;

/// Storage backend for migration definitions
#[async_trait]
pub trait MigrationSource: Send + Sync {
    /// All known migrations, sorted ascending by version
    async fn load_migrations(&self) -> MigrationResult<Vec<Migration>>;

    /// Persist a newly created migration; fails with `DuplicateVersion`
    /// when the version is already present.
    async fn save_migration(&self, migration: &Migration) -> MigrationResult<()>;
}

/// Directory of `.sql` migration files
pub struct FileSource {
    dir: PathBuf,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(migration: &Migration) -> String {
        format!("{}_{}.sql", migration.version, migration.name)
    }

    fn render_file(migration: &Migration) -> String {
        format!(
            "-- Migration: {}\n\
             -- Version: {}\n\
             -- Created: {}\n\n\
             -- up\n\
             {}\n\n\
             -- down\n\
             {}\n",
            migration.name,
            migration.version,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            migration.up_sql,
            migration.down_sql,
        )
    }
}

#[async_trait]
impl MigrationSource for FileSource {
    async fn load_migrations(&self) -> MigrationResult<Vec<Migration>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir)
            .map_err(|e| MigrationError::SourceRead(format!("failed to read migrations directory: {}", e)))?;

        let mut migrations = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| MigrationError::SourceRead(format!("failed to read directory entry: {}", e)))?;
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "sql") {
                migrations.push(parse_migration_file(&path)?);
            }
        }

        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(migrations)
    }

    async fn save_migration(&self, migration: &Migration) -> MigrationResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| MigrationError::SourceRead(format!("failed to create migrations directory: {}", e)))?;

        // Any existing file with the same version prefix is a collision,
        // regardless of name.
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| MigrationError::SourceRead(format!("failed to read migrations directory: {}", e)))?;
        for entry in entries.flatten() {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if stem.starts_with(&format!("{}_", migration.version)) {
                    return Err(MigrationError::DuplicateVersion(migration.version.clone()));
                }
            }
        }

        let path = self.dir.join(Self::file_name(migration));
        fs::write(&path, Self::render_file(migration))
            .map_err(|e| MigrationError::SourceRead(format!("failed to write migration file: {}", e)))?;
        Ok(())
    }
}

fn parse_migration_file(path: &Path) -> MigrationResult<Migration> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MigrationError::SourceRead(format!("invalid migration filename: {}", path.display())))?;

    let (version, name) = split_file_stem(stem).ok_or_else(|| {
        MigrationError::SourceRead(format!(
            "migration filename must follow YYYYMMDD_HHMMSS_name.sql: {}",
            path.display()
        ))
    })?;

    let content = fs::read_to_string(path)
        .map_err(|e| MigrationError::SourceRead(format!("failed to read {}: {}", path.display(), e)))?;
    let (up_sql, down_sql) = parse_sections(&content);

    Ok(Migration::with_sql(version, name, up_sql, down_sql))
}

/// Split `YYYYMMDD_HHMMSS_name` into version and name
fn split_file_stem(stem: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 3 {
        return None;
    }
    let is_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if parts[0].len() != 8 || !is_digits(parts[0]) || parts[1].len() != 6 || !is_digits(parts[1]) {
        return None;
    }
    let name = parts[2..].join("_");
    if name.is_empty() {
        return None;
    }
    Some((format!("{}_{}", parts[0], parts[1]), name))
}

/// Extract the `-- up` and `-- down` sections of a migration file
fn parse_sections(content: &str) -> (String, String) {
    let mut up_sql = Vec::new();
    let mut down_sql = Vec::new();
    let mut current = "";

    for line in content.lines() {
        let marker = line.trim().to_lowercase();
        if marker.starts_with("-- up") {
            current = "up";
            continue;
        } else if marker.starts_with("-- down") {
            current = "down";
            continue;
        }

        if line.trim().is_empty() || line.trim().starts_with("--") {
            continue;
        }

        match current {
            "up" => up_sql.push(line),
            "down" => down_sql.push(line),
            _ => {}
        }
    }

    (
        up_sql.join("\n").trim().to_string(),
        down_sql.join("\n").trim().to_string(),
    )
}

/// In-memory migration registry
pub struct MemorySource {
    migrations: Mutex<BTreeMap<String, Migration>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            migrations: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register or replace a migration definition programmatically
    pub async fn register(&self, migration: Migration) {
        self.migrations
            .lock()
            .await
            .insert(migration.version.clone(), migration);
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MigrationSource for MemorySource {
    async fn load_migrations(&self) -> MigrationResult<Vec<Migration>> {
        // BTreeMap keys keep version order.
        Ok(self.migrations.lock().await.values().cloned().collect())
    }

    async fn save_migration(&self, migration: &Migration) -> MigrationResult<()> {
        let mut migrations = self.migrations.lock().await;
        if migrations.contains_key(&migration.version) {
            return Err(MigrationError::DuplicateVersion(migration.version.clone()));
        }
        migrations.insert(migration.version.clone(), migration.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_source_round_trips_a_migration() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(dir.path());

        let migration = Migration::with_sql(
            "20240101_120000",
            "create_users",
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
            "DROP TABLE users;",
        );
        source.save_migration(&migration).await.unwrap();

        let loaded = source.load_migrations().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].version, "20240101_120000");
        assert_eq!(loaded[0].name, "create_users");
        assert_eq!(loaded[0].up(), "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        assert_eq!(loaded[0].down(), "DROP TABLE users;");
    }

    #[tokio::test]
    async fn file_source_loads_in_version_order() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(dir.path());

        for (version, name) in [
            ("20240101_130000", "second"),
            ("20240101_120000", "first"),
            ("20240101_140000", "third"),
        ] {
            source
                .save_migration(&Migration::with_sql(version, name, "SELECT 1;", ""))
                .await
                .unwrap();
        }

        let loaded = source.load_migrations().await.unwrap();
        let names: Vec<&str> = loaded.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn file_source_rejects_malformed_filenames() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("not_a_migration.sql"), "-- up\nSELECT 1;\n").unwrap();

        let source = FileSource::new(dir.path());
        let err = source.load_migrations().await.unwrap_err();
        assert!(matches!(err, MigrationError::SourceRead(_)));
    }

    #[tokio::test]
    async fn file_source_rejects_duplicate_versions() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(dir.path());

        let first = Migration::with_sql("20240101_120000", "one", "SELECT 1;", "");
        source.save_migration(&first).await.unwrap();

        // Same version, different name is still a collision.
        let second = Migration::with_sql("20240101_120000", "two", "SELECT 2;", "");
        let err = source.save_migration(&second).await.unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateVersion(_)));
    }

    #[tokio::test]
    async fn file_source_empty_directory_yields_no_migrations() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(dir.path().join("missing"));
        assert!(source.load_migrations().await.unwrap().is_empty());
    }

    #[test]
    fn parses_up_and_down_sections() {
        let content = "-- Migration: test\n\
                       -- up\n\
                       CREATE TABLE t (id INTEGER);\n\
                       CREATE INDEX idx ON t (id);\n\n\
                       -- down\n\
                       DROP TABLE t;\n";
        let (up, down) = parse_sections(content);
        assert_eq!(up, "CREATE TABLE t (id INTEGER);\nCREATE INDEX idx ON t (id);");
        assert_eq!(down, "DROP TABLE t;");
    }

    #[test]
    fn sections_default_to_empty() {
        let (up, down) = parse_sections("-- just a comment\n");
        assert_eq!(up, "");
        assert_eq!(down, "");
    }

    #[test]
    fn splits_version_and_name_from_stem() {
        assert_eq!(
            split_file_stem("20240101_120000_create_users_table"),
            Some(("20240101_120000".to_string(), "create_users_table".to_string()))
        );
        assert_eq!(split_file_stem("20240101_create_users"), None);
        assert_eq!(split_file_stem("20240101_120000_"), None);
    }

    #[tokio::test]
    async fn memory_source_keeps_version_order_and_rejects_duplicates() {
        let source = MemorySource::new();
        source
            .save_migration(&Migration::new("20240101_130000", "b"))
            .await
            .unwrap();
        source
            .save_migration(&Migration::new("20240101_120000", "a"))
            .await
            .unwrap();

        let loaded = source.load_migrations().await.unwrap();
        assert_eq!(loaded[0].name, "a");
        assert_eq!(loaded[1].name, "b");

        let err = source
            .save_migration(&Migration::new("20240101_120000", "dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateVersion(_)));
    }

    #[tokio::test]
    async fn memory_register_replaces_existing_definition() {
        let source = MemorySource::new();
        source.register(Migration::new("20240101_120000", "v1")).await;
        source.register(Migration::new("20240101_120000", "v2")).await;

        let loaded = source.load_migrations().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "v2");
    }
}
