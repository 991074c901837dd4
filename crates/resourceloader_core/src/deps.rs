use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};
use tracing::{debug, warn};

use crate::cache::{SharedCache, cache_key};
use crate::storage::Database;

const EMPTY_DEPS: &str = "[]";

/// Indirect file dependencies (images referenced from style sheets) per
/// (module, skin). Lookups go through an in-process map, then the shared
/// cache, then the `module_deps` table. Missing rows and read failures
/// both read as the empty list.
pub struct FileDependencyStore {
    database: Arc<Database>,
    shared: Arc<dyn SharedCache>,
    local: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl FileDependencyStore {
    pub fn new(database: Arc<Database>, shared: Arc<dyn SharedCache>) -> Self {
        Self {
            database,
            shared,
            local: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, module: &str, skin: &str) -> Vec<String> {
        let local_key = (module.to_string(), skin.to_string());
        if let Some(deps) = self
            .local
            .lock()
            .ok()
            .and_then(|local| local.get(&local_key).cloned())
        {
            return deps;
        }

        let key = shared_key(module, skin);
        let encoded = match self.shared.get(&key) {
            Some(encoded) => {
                debug!(module, skin, "module deps shared cache hit");
                encoded
            }
            None => {
                let encoded = match self.read_row(module, skin) {
                    Ok(Some(encoded)) => encoded,
                    Ok(None) => EMPTY_DEPS.to_string(),
                    Err(error) => {
                        // Not cached: the next lookup retries storage.
                        warn!(module, skin, "module deps read failed: {error:#}");
                        return Vec::new();
                    }
                };
                // An empty list is cached too, so absent rows are not re-read.
                self.shared.set(&key, &encoded);
                encoded
            }
        };

        let deps = serde_json::from_str::<Vec<String>>(&encoded).unwrap_or_else(|error| {
            warn!(module, skin, "discarding undecodable module deps: {error}");
            Vec::new()
        });
        self.remember(local_key, deps.clone());
        deps
    }

    /// Replace the stored list for (module, skin). Storage failures are
    /// returned to the caller.
    pub fn set(&self, module: &str, skin: &str, deps: &[String]) -> Result<()> {
        let encoded = serde_json::to_string(deps).context("failed to encode module deps")?;
        self.database
            .with_connection(|connection| {
                connection
                    .execute(
                        "INSERT OR REPLACE INTO module_deps (md_module, md_skin, md_deps)
                         VALUES (?1, ?2, ?3)",
                        params![module, skin, encoded],
                    )
                    .context("failed to write module_deps row")
            })
            .with_context(|| format!("failed to store file dependencies of {module} for {skin}"))?;

        self.shared.set(&shared_key(module, skin), &encoded);
        self.remember((module.to_string(), skin.to_string()), deps.to_vec());
        Ok(())
    }

    /// Write `deps` only when it differs from what is stored already.
    /// Returns `true` when a write happened.
    pub fn update(&self, module: &str, skin: &str, deps: &[String]) -> Result<bool> {
        if self.get(module, skin) == deps {
            debug!(module, skin, "module deps unchanged; write suppressed");
            return Ok(false);
        }
        self.set(module, skin, deps)?;
        Ok(true)
    }

    fn read_row(&self, module: &str, skin: &str) -> Result<Option<String>> {
        self.database.with_connection(|connection| {
            connection
                .query_row(
                    "SELECT md_deps FROM module_deps WHERE md_module = ?1 AND md_skin = ?2",
                    params![module, skin],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .context("failed to read module_deps row")
        })
    }

    fn remember(&self, key: (String, String), deps: Vec<String>) {
        if let Ok(mut local) = self.local.lock() {
            local.insert(key, deps);
        }
    }
}

fn shared_key(module: &str, skin: &str) -> String {
    cache_key(&["module_deps", module, skin])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::FileDependencyStore;
    use crate::cache::{MemoryCache, NullCache, SharedCache};
    use crate::runtime::ResolvedPaths;
    use crate::storage::Database;

    fn database(root: &std::path::Path) -> Arc<Database> {
        Arc::new(Database::open(&ResolvedPaths::for_root(root)).expect("open database"))
    }

    fn deps(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn round_trip_through_cold_store() {
        let temp = tempdir().expect("tempdir");
        let database = database(temp.path());

        let writer = FileDependencyStore::new(database.clone(), Arc::new(NullCache));
        writer
            .set("foo", "vector", &deps(&["images/x.png"]))
            .expect("set deps");

        let reader = FileDependencyStore::new(database, Arc::new(NullCache));
        assert_eq!(reader.get("foo", "vector"), deps(&["images/x.png"]));
        assert!(reader.get("foo", "monobook").is_empty());
    }

    #[test]
    fn absent_rows_are_negatively_cached() {
        let temp = tempdir().expect("tempdir");
        let shared = Arc::new(MemoryCache::new());
        let store = FileDependencyStore::new(database(temp.path()), shared.clone());

        assert!(store.get("foo", "vector").is_empty());
        assert_eq!(
            shared
                .get("resourceloader:module_deps:foo:vector")
                .as_deref(),
            Some("[]")
        );
    }

    #[test]
    fn shared_cache_answers_before_storage() {
        let temp = tempdir().expect("tempdir");
        let shared = Arc::new(MemoryCache::new());
        shared.set(
            "resourceloader:module_deps:foo:vector",
            r#"["images/cached.png"]"#,
        );
        let store = FileDependencyStore::new(database(temp.path()), shared);

        assert_eq!(store.get("foo", "vector"), deps(&["images/cached.png"]));
    }

    #[test]
    fn update_skips_identical_lists() {
        let temp = tempdir().expect("tempdir");
        let store = FileDependencyStore::new(database(temp.path()), Arc::new(MemoryCache::new()));

        assert!(store.update("foo", "vector", &deps(&["a.png"])).expect("first"));
        assert!(!store.update("foo", "vector", &deps(&["a.png"])).expect("second"));
        assert!(store.update("foo", "vector", &deps(&["a.png", "b.png"])).expect("third"));
        assert_eq!(store.get("foo", "vector"), deps(&["a.png", "b.png"]));
    }

    #[test]
    fn read_failures_degrade_and_write_failures_surface() {
        let temp = tempdir().expect("tempdir");
        let database = database(temp.path());
        database
            .with_connection(|connection| {
                connection.execute_batch("DROP TABLE module_deps")?;
                Ok(())
            })
            .expect("drop table");

        let store = FileDependencyStore::new(database, Arc::new(NullCache));
        assert!(store.get("foo", "vector").is_empty());

        let error = store
            .set("foo", "vector", &deps(&["a.png"]))
            .expect_err("write must fail");
        assert!(error.to_string().contains("foo"));
    }

    #[test]
    fn read_failures_are_not_cached() {
        let temp = tempdir().expect("tempdir");
        let database = database(temp.path());
        let shared = Arc::new(MemoryCache::new());
        FileDependencyStore::new(database.clone(), Arc::new(NullCache))
            .set("foo", "vector", &deps(&["a.png"]))
            .expect("set deps");

        database
            .with_connection(|connection| {
                connection.execute_batch("ALTER TABLE module_deps RENAME TO module_deps_offline")?;
                Ok(())
            })
            .expect("rename table");
        let store = FileDependencyStore::new(database.clone(), shared.clone());
        assert!(store.get("foo", "vector").is_empty());
        assert!(shared.is_empty());

        database
            .with_connection(|connection| {
                connection.execute_batch("ALTER TABLE module_deps_offline RENAME TO module_deps")?;
                Ok(())
            })
            .expect("restore table");
        assert_eq!(store.get("foo", "vector"), deps(&["a.png"]));
        let fresh = FileDependencyStore::new(database, shared);
        assert_eq!(fresh.get("foo", "vector"), deps(&["a.png"]));
    }
}
