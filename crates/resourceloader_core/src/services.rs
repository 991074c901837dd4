use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::cache::{MemoryCache, NullCache, SharedCache};
use crate::config::LoaderSettings;
use crate::deps::FileDependencyStore;
use crate::message_blob::MessageBlobStore;
use crate::runtime::ResolvedPaths;
use crate::storage::Database;
use crate::timestamp::{FileClock, LocalFilesystem};

/// Collaborators a module needs to render content and compute freshness.
/// Built once at startup and passed explicitly to every module call.
pub struct LoaderServices {
    root: PathBuf,
    wiki_pages_dir: PathBuf,
    settings: LoaderSettings,
    clock: Arc<dyn FileClock>,
    dependencies: FileDependencyStore,
    blobs: MessageBlobStore,
}

impl LoaderServices {
    pub fn new(
        paths: &ResolvedPaths,
        settings: LoaderSettings,
        clock: Arc<dyn FileClock>,
        database: Arc<Database>,
        shared: Arc<dyn SharedCache>,
    ) -> Self {
        Self {
            root: paths.project_root.clone(),
            wiki_pages_dir: paths.wiki_pages_dir.clone(),
            settings,
            clock,
            dependencies: FileDependencyStore::new(database.clone(), shared),
            blobs: MessageBlobStore::new(database),
        }
    }

    /// Local filesystem clock, on-disk database and, when enabled, an
    /// in-memory shared cache.
    pub fn open(paths: &ResolvedPaths, settings: LoaderSettings) -> Result<Self> {
        let database = Arc::new(Database::open(paths)?);
        let shared: Arc<dyn SharedCache> = if settings.shared_cache {
            Arc::new(MemoryCache::new())
        } else {
            Arc::new(NullCache)
        };
        Ok(Self::new(
            paths,
            settings,
            Arc::new(LocalFilesystem),
            database,
            shared,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wiki_pages_dir(&self) -> &Path {
        &self.wiki_pages_dir
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn clock(&self) -> &dyn FileClock {
        self.clock.as_ref()
    }

    pub fn dependencies(&self) -> &FileDependencyStore {
        &self.dependencies
    }

    pub fn blobs(&self) -> &MessageBlobStore {
        &self.blobs
    }
}
