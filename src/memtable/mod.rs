//! # Memtable Module
//!
//! The mutable, in-memory layer of the engine: a sorted map from `u64` keys to
//! either a live value or a tombstone.
//!
//! The memtable holds at most `capacity` distinct keys, which is exactly the
//! number of entries that fit in one SSTable. Inserting a *new* key into a
//! full table fails with [`MemtableError::FlushRequired`]; the engine reacts by
//! flushing the contents to level 0 and retrying. Overwriting a key that is
//! already present never fails, because it does not grow the key count.
//!
//! The memtable is not durable on its own. Values become durable when the
//! engine flushes them into the value log and an SSTable.
//!
//! Concurrency is handled one level up: the engine owns the memtable inside
//! its `RwLock`, so this type needs no interior locking.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::trace;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Key limit reached; a flush is required before this key can be added.
    #[error("Flush required")]
    FlushRequired,

    /// A memtable must be able to hold at least one key.
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(usize),
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// The payload stored for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemValue {
    /// A live, non-empty value.
    Value(Vec<u8>),

    /// A deletion marker that shadows older on-disk versions.
    Tombstone,
}

impl MemValue {
    /// Returns the live value, or `None` for a tombstone.
    pub fn as_value(&self) -> Option<&[u8]> {
        match self {
            MemValue::Value(v) => Some(v),
            MemValue::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, MemValue::Tombstone)
    }
}

/// A bounded, ordered key/value buffer.
#[derive(Debug)]
pub struct Memtable {
    /// Ordered key-value mapping. One entry per key.
    tree: BTreeMap<u64, MemValue>,

    /// Maximum number of distinct keys.
    capacity: usize,
}

impl Memtable {
    /// Creates an empty memtable that holds up to `capacity` distinct keys.
    pub fn new(capacity: usize) -> Result<Self, MemtableError> {
        if capacity == 0 {
            return Err(MemtableError::InvalidCapacity(capacity));
        }
        Ok(Self {
            tree: BTreeMap::new(),
            capacity,
        })
    }

    /// Inserts or overwrites `key`.
    ///
    /// # Errors
    /// [`MemtableError::FlushRequired`] if the table is full and `key` is not
    /// already present. The table is left unchanged in that case.
    pub fn put(&mut self, key: u64, value: MemValue) -> Result<(), MemtableError> {
        if let Some(slot) = self.tree.get_mut(&key) {
            trace!(key, "memtable overwrite");
            *slot = value;
            return Ok(());
        }

        if self.tree.len() >= self.capacity {
            return Err(MemtableError::FlushRequired);
        }

        trace!(key, tombstone = value.is_tombstone(), "memtable insert");
        self.tree.insert(key, value);
        Ok(())
    }

    /// Returns the entry stored for `key`, tombstones included.
    pub fn get(&self, key: u64) -> Option<&MemValue> {
        self.tree.get(&key)
    }

    /// Iterates entries with `lo <= key <= hi` in ascending key order.
    ///
    /// An inverted range yields nothing.
    pub fn scan(&self, lo: u64, hi: u64) -> impl Iterator<Item = (u64, &MemValue)> {
        let range = if lo <= hi {
            Some(self.tree.range(lo..=hi))
        } else {
            None
        };
        range.into_iter().flatten().map(|(k, v)| (*k, v))
    }

    /// Iterates every entry in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &MemValue)> {
        self.tree.iter().map(|(k, v)| (*k, v))
    }

    /// Number of distinct keys held.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.tree.clear();
    }
}
