//! Repository composition root.

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

use proxmox_sys::fs::create_path;

use skp_api_types::SweepStats;
use skp_datastore::{Catalog, ChunkStore, Error};

use crate::config::RepoConfig;

pub const CATALOG_DB_FILENAME: &str = "catalog.db";

/// A snapkeep repository with all engines attached.
///
/// Owns the chunk store and the catalog by value; engine entry points
/// (`backup`, `restore`, `verify`, `prune`, ...) are implemented in
/// their modules as methods on this type. Construction is total: every
/// component is fully initialized here or opening fails.
pub struct Engine {
    base: PathBuf,
    config: RepoConfig,
    chunk_store: ChunkStore,
    catalog: Catalog,
    // backup/restore/verify hold this shared, sweep holds it exclusive
    op_lock: RwLock<()>,
}

impl Engine {
    /// Initialize a fresh repository at `base` and open it.
    pub fn create(base: impl Into<PathBuf>, config: RepoConfig) -> Result<Self, Error> {
        let base: PathBuf = base.into();
        if !base.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "expected absolute repository path - got {base:?}"
            )));
        }

        create_path(&base, None, None)?;
        config.store(&base)?;

        let conn = Catalog::open_db(&base.join(CATALOG_DB_FILENAME))?;
        let chunk_store = ChunkStore::create(base.clone(), conn.clone(), config.compress_chunks)?;
        let catalog = Catalog::open(conn)?;

        log::info!("created repository at {base:?}");

        Ok(Engine {
            base,
            config,
            chunk_store,
            catalog,
            op_lock: RwLock::new(()),
        })
    }

    /// Open an existing repository.
    ///
    /// Unfinished snapshots left behind by a crash or cancellation are
    /// dropped here, together with the chunk references they took.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, Error> {
        let base: PathBuf = base.into();
        let config = RepoConfig::load(&base)?;

        let conn = Catalog::open_db(&base.join(CATALOG_DB_FILENAME))?;
        let chunk_store = ChunkStore::open(base.clone(), conn.clone(), config.compress_chunks)?;
        let catalog = Catalog::open(conn)?;

        let engine = Engine {
            base,
            config,
            chunk_store,
            catalog,
            op_lock: RwLock::new(()),
        };

        let removed = engine.catalog.remove_unfinished(&engine.chunk_store)?;
        if removed > 0 {
            log::info!("dropped {removed} unfinished snapshots during open");
        }

        Ok(engine)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunk_store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Shared guard taken by every backup/restore/verify run; fails
    /// with Conflict while a sweep holds the store exclusively.
    pub(crate) fn shared_op(&self) -> Result<RwLockReadGuard<'_, ()>, Error> {
        self.op_lock
            .try_read()
            .map_err(|_| Error::Conflict("chunk store sweep in progress".into()))
    }

    /// Reclaim all chunks with refcount zero.
    ///
    /// Requires the store exclusively: backups and restores running in
    /// other threads make this fail with Conflict instead of blocking.
    pub fn sweep(&self) -> Result<SweepStats, Error> {
        let _exclusive = self
            .op_lock
            .try_write()
            .map_err(|_| Error::Conflict("repository operations in progress".into()))?;
        self.chunk_store.sweep()
    }

    /// Flush outstanding catalog state and release the repository.
    pub fn close(self) -> Result<(), Error> {
        self.catalog.checkpoint()
    }
}
