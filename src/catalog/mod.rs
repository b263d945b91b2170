//! Level catalog: which tables exist and at which level.
//!
//! The catalog owns every decoded [`SSTable`] in an arena keyed by uid.
//! Each level keeps an ordered multimap `min_key -> uid` (a `BTreeSet` of
//! pairs), so tables of a level are always visited in `min_key` order and
//! overlap queries only walk tables whose `min_key` is small enough.
//!
//! Level 0 tables may overlap one another. Levels 1 and deeper are kept
//! non-overlapping by compaction, but the catalog itself does not enforce
//! that; queries filter on `max_key` and work for both shapes.


use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use tracing::{error, trace};

use crate::sstable::SSTable;

/// Catalog invariant violations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A level references a uid that is missing from the arena.
    #[error("level {level} references unknown table uid {uid}")]
    DanglingTable { level: usize, uid: u64 },
}

/// Tables per level plus the arena that owns them.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<u64, SSTable>,
    levels: Vec<BTreeSet<(u64, u64)>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `table` to `level`, taking ownership of it.
    pub fn register(&mut self, level: usize, table: SSTable) {
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, BTreeSet::new);
        }
        trace!(level, uid = table.uid(), min_key = table.min_key(), "Registering table");
        self.levels[level].insert((table.min_key(), table.uid()));
        self.tables.insert(table.uid(), table);
    }

    /// Removes table `uid` from `level` and returns it.
    ///
    /// Returns `None` if the table is not registered at that level.
    pub fn remove(&mut self, level: usize, uid: u64) -> Option<SSTable> {
        let min_key = self.tables.get(&uid)?.min_key();
        let set = self.levels.get_mut(level)?;
        if !set.remove(&(min_key, uid)) {
            return None;
        }
        self.tables.remove(&uid)
    }

    /// Borrows the table with `uid`.
    pub fn get(&self, uid: u64) -> Option<&SSTable> {
        self.tables.get(&uid)
    }

    /// Number of levels that have ever held a table.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Number of tables at `level`.
    pub fn level_len(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, BTreeSet::len)
    }

    /// Total number of tables.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Deepest level holding at least one table.
    pub fn deepest_nonempty_level(&self) -> Option<usize> {
        self.levels.iter().rposition(|set| !set.is_empty())
    }

    /// Whether any level strictly deeper than `level` holds a table.
    pub fn has_tables_below(&self, level: usize) -> bool {
        self.deepest_nonempty_level().is_some_and(|deepest| deepest > level)
    }

    /// All tables at `level` in ascending `min_key` order.
    pub fn tables_in_level(&self, level: usize) -> Result<Vec<&SSTable>, CatalogError> {
        let Some(set) = self.levels.get(level) else {
            return Ok(Vec::new());
        };
        set.iter().map(|&(_, uid)| self.resolve(level, uid)).collect()
    }

    /// Tables at `level` whose key range contains `key`.
    pub fn overlapping_point(&self, level: usize, key: u64) -> Result<Vec<&SSTable>, CatalogError> {
        self.overlapping_range(level, key, key)
    }

    /// Tables at `level` whose key range intersects `[lo, hi]`, in
    /// ascending `min_key` order.
    pub fn overlapping_range(
        &self,
        level: usize,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<&SSTable>, CatalogError> {
        let Some(set) = self.levels.get(level) else {
            return Ok(Vec::new());
        };
        if lo > hi {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for &(_, uid) in set.range(..=(hi, u64::MAX)) {
            let table = self.resolve(level, uid)?;
            if table.max_key() >= lo {
                out.push(table);
            }
        }
        Ok(out)
    }

    /// Drops every table and level.
    pub fn clear(&mut self) {
        self.tables.clear();
        self.levels.clear();
    }

    fn resolve(&self, level: usize, uid: u64) -> Result<&SSTable, CatalogError> {
        self.tables.get(&uid).ok_or_else(|| {
            error!(level, uid, "Catalog references a table missing from the arena");
            CatalogError::DanglingTable { level, uid }
        })
    }
}
