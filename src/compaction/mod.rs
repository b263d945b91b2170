//! # Compaction Module
//!
//! Leveled, size-bounded compaction for the LSM tree.
//!
//! ## Limits
//!
//! Level `L` may hold at most `fanout^(L+1)` tables (`2, 4, 8, ...` with the
//! default fanout of 2). After a flush registers new level-0 tables, the
//! engine calls [`run_cascade`], which compacts every overflowing level into
//! the next one, top to bottom.
//!
//! ## Selection
//!
//! - **Level 0**: the three oldest tables by `(timestamp, uid)`, or all of
//!   them when fewer remain. Level-0 tables overlap, so the oldest must move
//!   down first; a newer level-0 table left behind still shadows them.
//! - **Level 1+**: tables sorted by `(timestamp, min_key)`; the surplus
//!   above the limit is taken from the front.
//!
//! The key interval covered by the selection determines which tables of
//! the next level join the merge: every one that intersects it.
//!
//! ## Output
//!
//! Inputs go through the k-way merge in [`merge`]. Only the newest version
//! of each key survives; a surviving tombstone is dropped when no deeper
//! level holds any table. The result is re-chunked into fresh tables at the
//! next level, all carrying the largest input timestamp.
//!
//! ## Failure model
//!
//! A round is not transactional. Outputs are registered before sources are
//! removed, so a crash in between leaves duplicates on disk. Readers resolve
//! duplicates by timestamp and never assume a key lives in one table only.

pub mod merge;


use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogError};
use crate::sstable::{self, SSTableError, TableLayout};

use merge::{MergeIterator, Slot, latest_only, table_sources};

/// Number of level-0 tables merged per round.
pub const LEVEL0_COMPACTION_TABLES: usize = 3;

// ------------------------------------------------------------------------------------------------
// Shared error type
// ------------------------------------------------------------------------------------------------

/// Errors raised while compacting.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Context
// ------------------------------------------------------------------------------------------------

/// Everything a compaction round needs besides the catalog.
pub struct CompactionContext<'a> {
    /// Database root; levels live in `level-<L>` below it.
    pub data_dir: &'a Path,

    pub layout: TableLayout,

    /// Whether output tables are fsynced.
    pub sync: bool,

    /// Per-level growth factor.
    pub fanout: usize,
}

/// Maximum number of tables level `level` may hold.
pub fn level_limit(fanout: usize, level: usize) -> usize {
    let exp = u32::try_from(level + 1).unwrap_or(u32::MAX);
    fanout.saturating_pow(exp)
}

/// What one round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub level: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub entries_written: usize,
    pub tombstones_dropped: usize,
}

// ------------------------------------------------------------------------------------------------
// Cascade
// ------------------------------------------------------------------------------------------------

/// Compacts every overflowing level, starting at level 0.
///
/// `largest_uid` is advanced for each output table.
pub fn run_cascade(
    catalog: &mut Catalog,
    ctx: &CompactionContext<'_>,
    largest_uid: &mut u64,
) -> Result<Vec<RoundSummary>, CompactionError> {
    let mut rounds = Vec::new();
    let mut level = 0;

    while level < catalog.level_count() {
        while catalog.level_len(level) > level_limit(ctx.fanout, level) {
            rounds.push(compact_level(catalog, level, ctx, largest_uid)?);
        }
        level += 1;
    }

    Ok(rounds)
}

// ------------------------------------------------------------------------------------------------
// Single round
// ------------------------------------------------------------------------------------------------

/// Picks the tables of `level` that move down in the next round.
fn select_inputs(
    catalog: &Catalog,
    level: usize,
    fanout: usize,
) -> Result<Vec<u64>, CompactionError> {
    let mut tables = catalog.tables_in_level(level)?;

    let take = if level == 0 {
        tables.sort_by_key(|t| (t.timestamp(), t.uid()));
        LEVEL0_COMPACTION_TABLES.min(tables.len())
    } else {
        tables.sort_by_key(|t| (t.timestamp(), t.min_key()));
        tables.len().saturating_sub(level_limit(fanout, level))
    };

    Ok(tables.iter().take(take).map(|t| t.uid()).collect())
}

/// Merges the selected tables of `level` with the overlapping tables of
/// `level + 1` and writes the result to `level + 1`.
pub fn compact_level(
    catalog: &mut Catalog,
    level: usize,
    ctx: &CompactionContext<'_>,
    largest_uid: &mut u64,
) -> Result<RoundSummary, CompactionError> {
    let target = level + 1;
    let upper_uids = select_inputs(catalog, level, ctx.fanout)?;

    let mut summary = RoundSummary {
        level,
        ..RoundSummary::default()
    };
    if upper_uids.is_empty() {
        return Ok(summary);
    }

    let target_dir = ctx.data_dir.join(sstable::level_dir_name(target));
    fs::create_dir_all(&target_dir)?;

    let drop_tombstones = !catalog.has_tables_below(target);

    // Everything borrowed from the catalog stays inside this block.
    let (sources_to_remove, outputs) = {
        let upper: Vec<_> = upper_uids
            .iter()
            .filter_map(|uid| catalog.get(*uid))
            .collect();

        let lo = upper.iter().map(|t| t.min_key()).min().unwrap_or(0);
        let hi = upper.iter().map(|t| t.max_key()).max().unwrap_or(0);
        let lower = catalog.overlapping_range(target, lo, hi)?;

        let out_ts = upper
            .iter()
            .chain(lower.iter())
            .map(|t| t.timestamp())
            .max()
            .unwrap_or(0);

        let mut sources_to_remove: Vec<(usize, u64)> =
            upper.iter().map(|t| (level, t.uid())).collect();
        sources_to_remove.extend(lower.iter().map(|t| (target, t.uid())));
        summary.inputs = sources_to_remove.len();

        debug!(
            level,
            upper = upper.len(),
            lower = lower.len(),
            lo,
            hi,
            drop_tombstones,
            "Compaction round selected inputs"
        );

        let mut sources = table_sources(upper, u64::MIN, u64::MAX);
        sources.extend(table_sources(lower, u64::MIN, u64::MAX));

        let dropped = &mut summary.tombstones_dropped;
        let merged = latest_only(MergeIterator::new(sources)).filter_map(|entry| {
            let Slot::Disk(table_entry) = entry.slot else {
                return None;
            };
            if drop_tombstones && table_entry.is_tombstone() {
                *dropped += 1;
                return None;
            }
            Some(table_entry)
        });

        let outputs = sstable::write_run(&target_dir, &ctx.layout, ctx.sync, merged, || {
            *largest_uid += 1;
            (*largest_uid, out_ts)
        })?;

        (sources_to_remove, outputs)
    };

    summary.outputs = outputs.len();
    summary.entries_written = outputs.iter().map(|t| t.len()).sum();

    for table in outputs {
        catalog.register(target, table);
    }

    for (src_level, uid) in sources_to_remove {
        if let Some(table) = catalog.remove(src_level, uid)
            && let Err(e) = fs::remove_file(table.path())
        {
            warn!(uid, path = %table.path().display(), error = %e, "Failed to remove compacted SSTable");
        }
    }

    info!(
        level,
        inputs = summary.inputs,
        outputs = summary.outputs,
        entries = summary.entries_written,
        tombstones_dropped = summary.tombstones_dropped,
        "Compaction round finished"
    );

    Ok(summary)
}
