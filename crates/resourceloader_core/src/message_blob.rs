use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};
use tracing::warn;

use crate::storage::Database;
use crate::timestamp::{parse_mw_timestamp, to_mw_timestamp};

/// Read side of the `msg_resource` table plus the upsert used by the blob
/// builder. Lookups are not cached here.
#[derive(Debug, Clone)]
pub struct MessageBlobStore {
    database: Arc<Database>,
}

impl MessageBlobStore {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Last-modified time of the message blob for (module, lang), or 0 when
    /// the module has no messages, no blob was built, or storage failed.
    pub fn modified_time(&self, module: &str, messages: &[String], lang: &str) -> i64 {
        if messages.is_empty() {
            return 0;
        }
        match self.read_timestamp(module, lang) {
            Ok(Some(timestamp)) => timestamp,
            Ok(None) => 0,
            Err(error) => {
                warn!(module, lang, "message blob timestamp lookup failed: {error:#}");
                0
            }
        }
    }

    /// Stored JSON blob for (module, lang), if one was built.
    pub fn blob(&self, module: &str, lang: &str) -> Result<Option<String>> {
        self.database.with_connection(|connection| {
            connection
                .query_row(
                    "SELECT mr_blob FROM msg_resource WHERE mr_resource = ?1 AND mr_lang = ?2",
                    params![module, lang],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .with_context(|| format!("failed to read message blob for {module}/{lang}"))
        })
    }

    /// Upsert a blob and record which message keys it covers.
    pub fn insert_blob(
        &self,
        module: &str,
        lang: &str,
        messages: &[String],
        blob: &str,
        timestamp: i64,
    ) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(blob)
            .with_context(|| format!("message blob for {module}/{lang} is not valid JSON"))?;
        let mw_timestamp = to_mw_timestamp(timestamp);

        self.database.with_connection(|connection| {
            connection
                .execute(
                    "INSERT OR REPLACE INTO msg_resource (mr_resource, mr_lang, mr_blob, mr_timestamp)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![module, lang, blob, mw_timestamp],
                )
                .with_context(|| format!("failed to write message blob for {module}/{lang}"))?;
            let mut statement = connection
                .prepare(
                    "INSERT OR IGNORE INTO msg_resource_links (mrl_resource, mrl_message)
                     VALUES (?1, ?2)",
                )
                .context("failed to prepare msg_resource_links insert")?;
            for message in messages {
                statement
                    .execute(params![module, message])
                    .with_context(|| format!("failed to link message {message} to {module}"))?;
            }
            Ok(())
        })
    }

    /// Modules whose blobs include `message`.
    pub fn modules_using(&self, message: &str) -> Result<Vec<String>> {
        self.database.with_connection(|connection| {
            let mut statement = connection
                .prepare(
                    "SELECT mrl_resource FROM msg_resource_links
                     WHERE mrl_message = ?1
                     ORDER BY mrl_resource ASC",
                )
                .context("failed to prepare msg_resource_links query")?;
            let rows = statement
                .query_map([message], |row| row.get::<_, String>(0))
                .context("failed to run msg_resource_links query")?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("failed to decode msg_resource_links row")?);
            }
            Ok(out)
        })
    }

    fn read_timestamp(&self, module: &str, lang: &str) -> Result<Option<i64>> {
        let stored = self.database.with_connection(|connection| {
            connection
                .query_row(
                    "SELECT mr_timestamp FROM msg_resource WHERE mr_resource = ?1 AND mr_lang = ?2",
                    params![module, lang],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .context("failed to read msg_resource timestamp")
        })?;
        stored.as_deref().map(parse_mw_timestamp).transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::MessageBlobStore;
    use crate::runtime::ResolvedPaths;
    use crate::storage::Database;

    fn store(root: &std::path::Path) -> MessageBlobStore {
        MessageBlobStore::new(Arc::new(
            Database::open(&ResolvedPaths::for_root(root)).expect("open database"),
        ))
    }

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn module_without_messages_short_circuits() {
        let temp = tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .insert_blob("foo", "en", &keys(&["a"]), "{}", 5_000)
            .expect("insert");

        assert_eq!(store.modified_time("foo", &[], "en"), 0);
    }

    #[test]
    fn stored_timestamp_is_returned_per_language() {
        let temp = tempdir().expect("tempdir");
        let store = store(temp.path());
        let messages = keys(&["showtoc", "hidetoc"]);
        store
            .insert_blob(
                "mediawiki.util",
                "en",
                &messages,
                r#"{"showtoc":"show","hidetoc":"hide"}"#,
                1_298_900_709,
            )
            .expect("insert");

        assert_eq!(
            store.modified_time("mediawiki.util", &messages, "en"),
            1_298_900_709
        );
        assert_eq!(store.modified_time("mediawiki.util", &messages, "de"), 0);
        assert_eq!(
            store.blob("mediawiki.util", "en").expect("blob").as_deref(),
            Some(r#"{"showtoc":"show","hidetoc":"hide"}"#)
        );
        assert_eq!(
            store.modules_using("showtoc").expect("links"),
            vec!["mediawiki.util".to_string()]
        );
    }

    #[test]
    fn storage_failure_reads_as_zero() {
        let temp = tempdir().expect("tempdir");
        let database = Arc::new(
            Database::open(&ResolvedPaths::for_root(temp.path())).expect("open database"),
        );
        database
            .with_connection(|connection| {
                connection.execute_batch("DROP TABLE msg_resource")?;
                Ok(())
            })
            .expect("drop table");

        let store = MessageBlobStore::new(database);
        assert_eq!(store.modified_time("foo", &keys(&["a"]), "en"), 0);
    }

    #[test]
    fn invalid_blob_json_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let store = store(temp.path());
        let error = store
            .insert_blob("foo", "en", &[], "{not json", 1)
            .expect_err("must fail");
        assert!(error.to_string().contains("not valid JSON"));
    }
}
