use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rusqlite::Connection;

use crate::migrate::{apply_pending_migrations, pending_migrations};
use crate::runtime::ResolvedPaths;

/// Durable storage shared by the dependency store and the message blob
/// lookup. One SQLite connection guarded by a mutex; callers never hold
/// the lock across anything but a single statement batch.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    connection: Mutex<Connection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    pub module_deps_rows: usize,
    pub msg_resource_rows: usize,
    pub schema_version: u32,
}

impl Database {
    /// Open the database, creating it and applying pending migrations.
    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        ensure_db_parent(&paths.db_path)?;
        let connection = open_connection(&paths.db_path)?;
        apply_pending_migrations(&connection)?;
        Ok(Self {
            path: paths.db_path.clone(),
            connection: Mutex::new(connection),
        })
    }

    /// Open an existing database without touching its schema.
    pub fn open_existing(db_path: &Path) -> Result<Option<Self>> {
        if !db_path.exists() {
            return Ok(None);
        }
        let connection = open_connection(db_path)?;
        Ok(Some(Self {
            path: db_path.to_path_buf(),
            connection: Mutex::new(connection),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .connection
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned for {}", self.path.display()))?;
        f(&guard)
    }

    pub fn stats(&self) -> Result<StorageStats> {
        self.with_connection(|connection| {
            let module_deps_rows = if table_exists(connection, "module_deps")? {
                count_query(connection, "SELECT COUNT(*) FROM module_deps")?
            } else {
                0
            };
            let msg_resource_rows = if table_exists(connection, "msg_resource")? {
                count_query(connection, "SELECT COUNT(*) FROM msg_resource")?
            } else {
                0
            };
            let schema_version = crate::migrate::current_version(connection)?;
            Ok(StorageStats {
                module_deps_rows,
                msg_resource_rows,
                schema_version,
            })
        })
    }

    pub fn pending_migration_count(&self) -> Result<usize> {
        self.with_connection(|connection| Ok(pending_migrations(connection)?.len()))
    }
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

pub(crate) fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

pub(crate) fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}
