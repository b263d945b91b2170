//! # wisckv
//!
//! An embeddable key-value storage engine built on a **Log-Structured Merge
//! Tree** that keeps values in a separate append-only **value log**. Keys
//! are `u64`; values are non-empty byte strings.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wisckv::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! // Write
//! db.put(1, b"world").unwrap();
//!
//! // Read
//! assert_eq!(db.get(1).unwrap(), Some(b"world".to_vec()));
//!
//! // Delete
//! assert!(db.delete(1).unwrap());
//! assert_eq!(db.get(1).unwrap(), None);
//!
//! // Scan (inclusive bounds)
//! db.put(10, b"a").unwrap();
//! db.put(11, b"b").unwrap();
//! assert_eq!(db.scan(10, 11).unwrap().len(), 2);
//!
//! // Reclaim value log space
//! db.gc(64 * 1024).unwrap();
//!
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Key-value separation**: SSTables hold `(key, offset, len)` only, so
//!   compaction never rewrites values.
//! - **Leveled compaction**: level `L` holds at most `fanout^(L+1)` tables.
//! - **Bloom filters** on every table for fast negative lookups.
//! - **CRC-16 integrity** on every value log record.
//! - **Value log GC** with live-data detection and hole punching.
//! - **Directory-driven recovery**: no manifest; tables and log pointers are
//!   rediscovered at open.

#![allow(dead_code)]

pub(crate) mod bloom;
pub(crate) mod catalog;
pub(crate) mod compaction;
pub(crate) mod encoding;
pub(crate) mod engine;
pub(crate) mod memtable;
pub(crate) mod sstable;
pub(crate) mod vlog;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use engine::{Engine, EngineConfig};
use thiserror::Error;
use tracing::{info, warn};

pub use engine::{EngineError, EngineStats};
pub use sstable::SSTableError;
pub use vlog::VlogError;

/// A single key-value pair returned by [`Db::scan`].
pub type KeyValue = (u64, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// All fields have sensible defaults via [`DbConfig::default()`].
/// The configuration is validated when passed to [`Db::open`].
///
/// # Example
///
/// ```rust
/// use wisckv::DbConfig;
///
/// let config = DbConfig {
///     max_table_bytes: 64 * 1024,
///     sync_writes: false,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Maximum size of one SSTable file in bytes.
    ///
    /// Together with the Bloom filter size this fixes the number of entries
    /// per table, which is also the memtable capacity.
    ///
    /// Default: 32 KiB. Must leave room for at least one entry.
    pub max_table_bytes: u64,

    /// Bloom filter size in bits.
    ///
    /// Default: 65 536. Must be a positive multiple of 8.
    pub bloom_bits: u32,

    /// Bloom filter probes per key.
    ///
    /// Default: 4. Must be ≥ 1.
    pub bloom_hashes: u32,

    /// Consult Bloom filters on point lookups. The on-disk format is the
    /// same either way.
    ///
    /// Default: `true`.
    pub use_bloom: bool,

    /// Growth factor between levels.
    ///
    /// Default: 2. Must be ≥ 1.
    pub level_fanout: usize,

    /// Fsync value log batches and table files.
    ///
    /// Default: `true`.
    pub sync_writes: bool,

    /// Value log location. `None` places it at `<dir>/vlog`.
    pub vlog_path: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_table_bytes: 32 * 1024,
            bloom_bits: 65_536,
            bloom_hashes: 4,
            use_bloom: true,
            level_fanout: 2,
            sync_writes: true,
            vlog_path: None,
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), DbError> {
        if self.bloom_bits == 0 || self.bloom_bits % 8 != 0 {
            return Err(DbError::InvalidConfig(
                "bloom_bits must be a positive multiple of 8".into(),
            ));
        }
        if self.bloom_hashes < 1 {
            return Err(DbError::InvalidConfig("bloom_hashes must be >= 1".into()));
        }
        if self.level_fanout < 1 {
            return Err(DbError::InvalidConfig("level_fanout must be >= 1".into()));
        }
        if self.to_engine_config().table_layout().max_entries() == 0 {
            return Err(DbError::InvalidConfig(
                "max_table_bytes leaves no room for entries after header and bloom filter".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_table_bytes: self.max_table_bytes,
            bloom_bits: self.bloom_bits,
            bloom_hashes: self.bloom_hashes,
            use_bloom: self.use_bloom,
            level_fanout: self.level_fanout,
            sync_writes: self.sync_writes,
            vlog_path: self.vlog_path.clone(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Value constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// # Thread safety
///
/// `Db` is `Send + Sync`; share it across threads via `Arc<Db>`. Every
/// operation runs synchronously on the calling thread: flushes and
/// compaction happen inside the `put` that overflows the memtable.
///
/// # Shutdown
///
/// Call [`Db::close`] to flush buffered writes. If the handle is dropped
/// without calling `close`, the destructor flushes on a best-effort basis.
pub struct Db {
    engine: Engine,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database at the given directory.
    ///
    /// On an existing directory, every SSTable is decoded and the value
    /// log's head and tail are recovered.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any configuration parameter
    /// is out of range, or an engine error if an on-disk file is malformed.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;

        let engine = Engine::open(&path, config.to_engine_config())?;
        info!(path = %path.as_ref().display(), "database opened");

        Ok(Self {
            engine,
            closed: AtomicBool::new(false),
        })
    }

    /// Flushes buffered writes and fsyncs the data directories.
    ///
    /// Subsequent operations on this handle return [`DbError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.close()?;
        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key-value pair.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `value` is empty; an empty
    /// stored length is reserved for tombstones.
    pub fn put(&self, key: u64, value: &[u8]) -> Result<(), DbError> {
        self.check_open()?;

        if value.is_empty() {
            return Err(DbError::InvalidArgument("value must not be empty".into()));
        }
        if u32::try_from(value.len()).is_err() {
            return Err(DbError::InvalidArgument(
                "value must be shorter than 4 GiB".into(),
            ));
        }

        self.engine.put(key, value.to_vec())?;
        Ok(())
    }

    /// Deletes a key.
    ///
    /// Returns `false`, writing nothing, when the key is not present.
    pub fn delete(&self, key: u64) -> Result<bool, DbError> {
        self.check_open()?;
        Ok(self.engine.delete(key)?)
    }

    /// Writes the memtable out to level 0 (running compaction if needed).
    pub fn flush(&self) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.engine.flush()?)
    }

    /// Removes every key and every file the database owns.
    pub fn reset(&self) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.engine.reset()?)
    }

    /// Runs one value log garbage collection pass over at least
    /// `chunk_size` bytes from the tail.
    ///
    /// Returns the number of bytes reclaimed.
    pub fn gc(&self, chunk_size: u64) -> Result<u64, DbError> {
        self.check_open()?;
        Ok(self.engine.gc(chunk_size)?)
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the value associated with a key.
    ///
    /// Returns `Ok(None)` if the key does not exist or has been deleted.
    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        Ok(self.engine.get(key)?)
    }

    /// Scans all live key-value pairs with keys in `[lo, hi]`.
    ///
    /// Returns pairs sorted by key in ascending order, or an empty `Vec`
    /// when `lo > hi`.
    pub fn scan(&self, lo: u64, hi: u64) -> Result<Vec<KeyValue>, DbError> {
        self.check_open()?;
        Ok(self.engine.scan(lo, hi)?)
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire)
            && let Err(e) = self.engine.close()
        {
            warn!(error = %e, "flush on drop failed");
        }
    }
}
