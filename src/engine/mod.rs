//! # LSM Storage Engine
//!
//! A **synchronous** LSM-tree engine over `u64` keys that keeps values out of
//! the tree: SSTables index `(key, offset, vlen)` triples pointing into an
//! append-only value log.
//!
//! ## Design Overview
//!
//! Data lives in three places, queried newest-first:
//!
//! 1. **Memtable**: a bounded in-memory sorted map of values and tombstones.
//! 2. **Levels**: immutable SSTables under `level-<L>/<uid>.sst`, indexed by
//!    the [`Catalog`]. Level 0 may overlap; deeper levels do not.
//! 3. **Value log**: the bytes of every value, addressed by offset.
//!
//! A write into a full memtable triggers a flush: the memtable's values are
//! appended to the log in one batch, its sorted index is written as level-0
//! tables, and the compaction cascade runs. There is no write-ahead log;
//! writes still in the memtable are lost on a crash unless [`Engine::flush`]
//! ran.
//!
//! ## Garbage collection
//!
//! [`Engine::gc`] walks the log from its tail. A record is live when the
//! tree still points at exactly its offset; live records are re-inserted
//! through the normal write path, then the scanned span is flushed,
//! hole-punched and the tail advanced.
//!
//! ## Concurrency Model
//!
//! All state sits behind a single `Arc<RwLock<EngineInner>>`. Lookups and
//! scans take a **read lock**; every mutation takes a **write lock** and
//! runs to completion.
//!
//! ## Recovery
//!
//! There is no manifest. [`Engine::open`] rebuilds the catalog from the
//! `level-<L>` directories and recovers the log pointers from the log file
//! itself; uid and timestamp counters resume from the largest values found.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::catalog::{Catalog, CatalogError};
use crate::compaction::{self, CompactionContext, CompactionError};
use crate::compaction::merge::{self, MergeEntry, MergeIterator, Slot, Source};
use crate::memtable::{MemValue, Memtable, MemtableError};
use crate::sstable::{self, SSTable, SSTableError, TableEntry, TableLayout};
use crate::vlog::{ValueLog, VlogError};

#[cfg(test)]
mod tests;

/// Default value log file name inside the data directory.
pub const VLOG_FILE_NAME: &str = "vlog";

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the value log.
    #[error("Value log error: {0}")]
    Vlog(#[from] VlogError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// A compaction round failed.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Error originating from the memtable.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation (poisoned lock, catalog inconsistency, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CatalogError> for EngineError {
    fn from(e: CatalogError) -> Self {
        EngineError::Internal(e.to_string())
    }
}

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on a table file's size; fixes entries per table and the
    /// memtable capacity.
    pub max_table_bytes: u64,

    /// Bloom filter size in bits (multiple of 8).
    pub bloom_bits: u32,

    /// Bloom filter probes per key.
    pub bloom_hashes: u32,

    /// Consult Bloom filters on point lookups.
    pub use_bloom: bool,

    /// Level `L` holds at most `level_fanout^(L+1)` tables.
    pub level_fanout: usize,

    /// Fsync log appends and table files.
    pub sync_writes: bool,

    /// Value log location; `<dir>/vlog` when `None`.
    pub vlog_path: Option<PathBuf>,
}

impl Default for EngineConfig {
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

impl EngineConfig {
    pub fn table_layout(&self) -> TableLayout {
        TableLayout {
            bloom_bits: self.bloom_bits,
            bloom_hashes: self.bloom_hashes,
            max_table_bytes: self.max_table_bytes,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Keys (values and tombstones) currently buffered in memory.
    pub memtable_len: usize,
    /// Number of tables in each level, level 0 first.
    pub tables_per_level: Vec<usize>,
    /// Value log append position.
    pub vlog_head: u64,
    /// First unreclaimed value log byte.
    pub vlog_tail: u64,
}

impl EngineStats {
    pub fn table_count(&self) -> usize {
        self.tables_per_level.iter().sum()
    }
}

struct EngineInner {
    /// Root directory holding the `level-<L>` directories.
    data_dir: PathBuf,

    config: EngineConfig,

    layout: TableLayout,

    memtable: Memtable,

    catalog: Catalog,

    vlog: ValueLog,

    /// Largest uid ever handed out.
    largest_uid: u64,

    /// Largest flush timestamp ever handed out.
    largest_timestamp: u64,
}

/// Where the newest version of a key was found.
enum Located<'a> {
    Memory(&'a MemValue),
    Disk(TableEntry),
    Missing,
}

/// The main LSM storage engine handle.
///
/// Thread-safe: can be cloned and shared across threads via the
/// internal `Arc<RwLock<_>>`.
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    /// Acquires a read lock on the engine state.
    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, EngineInner>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    /// Acquires a write lock on the engine state.
    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, EngineInner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Write helpers
    // --------------------------------------------------------------------------------------------

    /// Executes a memtable write, flushing the memtable and retrying once
    /// if it is full.
    ///
    /// Returns `Ok(true)` if a flush occurred, `Ok(false)` otherwise.
    fn write_with_retry(
        inner: &mut EngineInner,
        mut op: impl FnMut(&mut Memtable) -> Result<(), MemtableError>,
    ) -> Result<bool, EngineError> {
        match op(&mut inner.memtable) {
            Ok(()) => Ok(false),
            Err(MemtableError::FlushRequired) => {
                Self::flush_inner(inner)?;
                op(&mut inner.memtable)?;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) an engine rooted at the given directory.
    ///
    /// Every `level-<L>/<uid>.sst` file is decoded into the catalog; leftover
    /// `*.sst.tmp` files from an interrupted write are removed. The value log
    /// is opened (and its trailing garbage truncated) last.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let base = path.as_ref();
        fs::create_dir_all(base)?;

        let layout = config.table_layout();
        let memtable = Memtable::new(layout.max_entries())?;

        // 1. Rebuild the catalog from the level directories.
        let mut catalog = Catalog::new();
        let mut largest_uid = 0u64;
        let mut largest_timestamp = 0u64;

        for entry in fs::read_dir(base)? {
            let level_path = entry?.path();
            if !level_path.is_dir() {
                continue;
            }
            let Some(level) = sstable::parse_level_dir(&level_path) else {
                continue;
            };

            for file in fs::read_dir(&level_path)? {
                let file_path = file?.path();
                if !file_path.is_file() {
                    continue;
                }

                if file_path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|name| name.ends_with(sstable::SST_TMP_EXTENSION))
                {
                    warn!(path = %file_path.display(), "Removing leftover temporary SSTable");
                    fs::remove_file(&file_path)?;
                    continue;
                }

                let Some(uid) = sstable::parse_table_uid(&file_path) else {
                    continue;
                };
                let table = SSTable::open(&file_path, uid, &layout)?;
                largest_uid = largest_uid.max(uid);
                largest_timestamp = largest_timestamp.max(table.timestamp());
                catalog.register(level, table);
            }
        }

        // 2. Recover the value log.
        let vlog_path = config
            .vlog_path
            .clone()
            .unwrap_or_else(|| base.join(VLOG_FILE_NAME));
        let vlog = ValueLog::open(&vlog_path, config.sync_writes)?;

        info!(
            path = %base.display(),
            tables = catalog.table_count(),
            levels = catalog.level_count(),
            largest_uid,
            largest_timestamp,
            "Opened engine"
        );

        let inner = EngineInner {
            data_dir: base.to_path_buf(),
            config,
            layout,
            memtable,
            catalog,
            vlog,
            largest_uid,
            largest_timestamp,
        };

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Flushes the memtable and fsyncs the data directories.
    pub fn close(&self) -> Result<(), EngineError> {
        let mut inner = self.write_lock()?;
        Self::flush_inner(&mut inner)?;

        for level in 0..inner.catalog.level_count() {
            let dir = inner.data_dir.join(sstable::level_dir_name(level));
            if let Ok(handle) = fs::File::open(&dir) {
                handle.sync_all()?;
            }
        }
        if let Ok(root) = fs::File::open(&inner.data_dir) {
            root.sync_all()?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts or overwrites `key`.
    ///
    /// Returns `Ok(true)` if the write triggered a flush.
    pub fn put(&self, key: u64, value: Vec<u8>) -> Result<bool, EngineError> {
        let mut inner = self.write_lock()?;
        trace!(key, value_len = value.len(), "engine put");
        Self::write_with_retry(&mut inner, |memtable| {
            memtable.put(key, MemValue::Value(value.clone()))
        })
    }

    /// Deletes `key` by writing a tombstone.
    ///
    /// Returns `Ok(false)` without writing anything when the key is absent.
    pub fn delete(&self, key: u64) -> Result<bool, EngineError> {
        let mut inner = self.write_lock()?;
        trace!(key, "engine delete");

        let live = match Self::locate(&inner, key)? {
            Located::Memory(value) => !value.is_tombstone(),
            Located::Disk(entry) => !entry.is_tombstone(),
            Located::Missing => false,
        };
        if !live {
            return Ok(false);
        }

        Self::write_with_retry(&mut inner, |memtable| memtable.put(key, MemValue::Tombstone))?;
        Ok(true)
    }

    /// Forces the memtable to disk. A no-op when it is empty.
    pub fn flush(&self) -> Result<(), EngineError> {
        let mut inner = self.write_lock()?;
        Self::flush_inner(&mut inner)
    }

    /// Removes every key: memtable, tables and log contents.
    ///
    /// Files go first; in-memory state is cleared only once they are gone.
    pub fn reset(&self) -> Result<(), EngineError> {
        let mut inner = self.write_lock()?;
        let inner = &mut *inner;

        for entry in fs::read_dir(&inner.data_dir)? {
            let path = entry?.path();
            if path.is_dir() && sstable::parse_level_dir(&path).is_some() {
                fs::remove_dir_all(&path)?;
            }
        }
        inner.vlog.reset()?;

        inner.memtable.clear();
        inner.catalog.clear();
        inner.largest_uid = 0;
        inner.largest_timestamp = 0;

        info!(path = %inner.data_dir.display(), "Engine reset");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Looks up a single key.
    ///
    /// Returns `Ok(None)` if the key was deleted or never written.
    ///
    /// The memtable is consulted first. Then levels are searched from 0
    /// down: among the tables of one level covering the key, the highest
    /// timestamp wins, and the first level with a winner decides.
    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>, EngineError> {
        trace!(key, "engine get");
        let inner = self.read_lock()?;

        match Self::locate(&inner, key)? {
            Located::Memory(value) => Ok(value.as_value().map(<[u8]>::to_vec)),
            Located::Disk(entry) if entry.is_tombstone() => Ok(None),
            Located::Disk(entry) => Self::read_value(&inner, &entry).map(Some),
            Located::Missing => Ok(None),
        }
    }

    /// Log offset of the live on-disk version of `key`.
    ///
    /// `None` when the memtable holds the key, when the newest on-disk
    /// version is a tombstone, or when the key is unknown.
    pub fn get_offset(&self, key: u64) -> Result<Option<u64>, EngineError> {
        let inner = self.read_lock()?;
        Self::offset_inner(&inner, key)
    }

    /// Live key-value pairs with keys in `[lo, hi]`, ascending.
    pub fn scan(&self, lo: u64, hi: u64) -> Result<Vec<(u64, Vec<u8>)>, EngineError> {
        Ok(self
            .scan_raw(lo, hi)?
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    /// Like [`Engine::scan`] but keeps winning tombstones as `None`.
    ///
    /// The memtable range and every overlapping table of every level are
    /// merged in one pass; see [`merge`] for the ordering.
    pub fn scan_raw(&self, lo: u64, hi: u64) -> Result<Vec<(u64, Option<Vec<u8>>)>, EngineError> {
        trace!(lo, hi, "engine scan");
        let inner = self.read_lock()?;
        if lo > hi {
            return Ok(Vec::new());
        }

        let mut sources: Vec<Source<'_>> = Vec::new();
        sources.push(Box::new(inner.memtable.scan(lo, hi).map(|(key, value)| {
            MergeEntry::memory(key, value.as_value().map(<[u8]>::to_vec))
        })));
        for level in 0..inner.catalog.level_count() {
            let tables = inner.catalog.overlapping_range(level, lo, hi)?;
            sources.extend(merge::table_sources(tables, lo, hi));
        }

        let mut out = Vec::new();
        for entry in merge::latest_only(MergeIterator::new(sources)) {
            let value = match entry.slot {
                Slot::Memory(value) => value,
                Slot::Disk(table_entry) if table_entry.is_tombstone() => None,
                Slot::Disk(table_entry) => Some(Self::read_value(&inner, &table_entry)?),
            };
            out.push((entry.key, value));
        }
        Ok(out)
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let inner = self.read_lock()?;
        Ok(EngineStats {
            memtable_len: inner.memtable.len(),
            tables_per_level: (0..inner.catalog.level_count())
                .map(|level| inner.catalog.level_len(level))
                .collect(),
            vlog_head: inner.vlog.head(),
            vlog_tail: inner.vlog.tail(),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Garbage collection
    // --------------------------------------------------------------------------------------------

    /// Reclaims at least `chunk_size` bytes (or up to the head) from the
    /// value log tail.
    ///
    /// Returns the number of bytes reclaimed. A corrupt record at the scan
    /// position fails the call with [`VlogError::Corrupt`] and leaves the
    /// tail where it was.
    pub fn gc(&self, chunk_size: u64) -> Result<u64, EngineError> {
        let mut inner = self.write_lock()?;
        let inner = &mut *inner;

        let old_tail = inner.vlog.tail();
        let limit = inner.vlog.head();
        let mut cursor = old_tail;
        let mut relocated = 0usize;
        let mut discarded = 0usize;

        while cursor < limit && cursor - old_tail < chunk_size {
            let record = inner.vlog.validate_record_at(cursor)?;
            if Self::offset_inner(inner, record.key)? == Some(cursor) {
                Self::write_with_retry(inner, |memtable| {
                    memtable.put(record.key, MemValue::Value(record.value.clone()))
                })?;
                relocated += 1;
            } else {
                discarded += 1;
            }
            cursor += record.record_len();
        }

        if cursor == old_tail {
            return Ok(0);
        }

        // Relocated values must be indexed before their old copies vanish.
        Self::flush_inner(inner)?;
        inner.vlog.punch_hole(old_tail, cursor - old_tail)?;
        inner.vlog.advance_tail(cursor);

        let reclaimed = cursor - old_tail;
        info!(
            old_tail,
            new_tail = cursor,
            reclaimed,
            relocated,
            discarded,
            "Value log GC pass finished"
        );
        Ok(reclaimed)
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn locate(inner: &EngineInner, key: u64) -> Result<Located<'_>, EngineError> {
        if let Some(value) = inner.memtable.get(key) {
            return Ok(Located::Memory(value));
        }

        for level in 0..inner.catalog.level_count() {
            let winner = inner
                .catalog
                .overlapping_point(level, key)?
                .into_iter()
                .filter_map(|table| {
                    table
                        .find(key, inner.config.use_bloom)
                        .map(|entry| (table.timestamp(), entry))
                })
                .max_by_key(|(timestamp, entry)| (*timestamp, entry.offset));

            if let Some((_, entry)) = winner {
                return Ok(Located::Disk(entry));
            }
        }
        Ok(Located::Missing)
    }

    fn offset_inner(inner: &EngineInner, key: u64) -> Result<Option<u64>, EngineError> {
        Ok(match Self::locate(inner, key)? {
            Located::Disk(entry) if !entry.is_tombstone() => Some(entry.offset),
            _ => None,
        })
    }

    fn read_value(inner: &EngineInner, entry: &TableEntry) -> Result<Vec<u8>, EngineError> {
        let record = inner.vlog.read_record_at(entry.offset)?;
        if record.key != entry.key || record.value.len() != entry.vlen as usize {
            error!(
                key = entry.key,
                offset = entry.offset,
                found_key = record.key,
                "Index entry points at a foreign value log record"
            );
            return Err(EngineError::Internal(format!(
                "value log record at {} does not belong to key {}",
                entry.offset, entry.key
            )));
        }
        Ok(record.value)
    }

    /// Writes the memtable out: log batch, level-0 tables, catalog, cascade.
    ///
    /// The memtable is cleared only after its tables are registered.
    fn flush_inner(inner: &mut EngineInner) -> Result<(), EngineError> {
        if inner.memtable.is_empty() {
            return Ok(());
        }

        // 1. Values go to the log in key order.
        let offsets = inner
            .vlog
            .append_batch(inner.memtable.iter().map(|(key, value)| (key, value.as_value())))?;

        let mut entries = Vec::with_capacity(offsets.len());
        for ((key, value), offset) in inner.memtable.iter().zip(offsets) {
            let vlen = match value.as_value() {
                Some(bytes) => u32::try_from(bytes.len())
                    .map_err(|_| EngineError::Internal(format!("value of key {key} too long")))?,
                None => 0,
            };
            entries.push(TableEntry { key, offset, vlen });
        }

        // 2. Index goes to level 0.
        let level0 = inner.data_dir.join(sstable::level_dir_name(0));
        fs::create_dir_all(&level0)?;

        let uid = &mut inner.largest_uid;
        let timestamp = &mut inner.largest_timestamp;
        let tables = sstable::write_run(
            &level0,
            &inner.layout,
            inner.config.sync_writes,
            entries,
            || {
                *uid += 1;
                *timestamp += 1;
                (*uid, *timestamp)
            },
        )?;

        debug!(
            keys = inner.memtable.len(),
            tables = tables.len(),
            vlog_head = inner.vlog.head(),
            "Flushed memtable"
        );

        for table in tables {
            inner.catalog.register(0, table);
        }
        inner.memtable.clear();

        // 3. Push overflow down.
        let ctx = CompactionContext {
            data_dir: &inner.data_dir,
            layout: inner.layout,
            sync: inner.config.sync_writes,
            fanout: inner.config.level_fanout,
        };
        let rounds = compaction::run_cascade(&mut inner.catalog, &ctx, &mut inner.largest_uid)
            .inspect_err(|e| error!(error = %e, "Compaction cascade failed"))?;
        if !rounds.is_empty() {
            debug!(rounds = rounds.len(), "Compaction cascade finished");
        }

        Ok(())
    }
}
