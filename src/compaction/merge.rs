//! K-way merge over sorted entry streams.
//!
//! Both compaction and range scans funnel several sorted sources through a
//! single [`MergeIterator`]. A source is usually a *track*: an ordered list
//! of non-overlapping tables read one file after another, so a whole level
//! of non-overlapping tables costs one heap slot rather than one per table.
//!
//! # Ordering
//!
//! Entries pop in ascending key order. For equal keys the newest version
//! pops first:
//!
//! 1. in-memory (memtable) entries beat every on-disk entry;
//! 2. among on-disk entries, the larger value log offset wins, because a
//!    later write always lands further along the log;
//! 3. equal offsets (a tombstone flushed at the same head position as a
//!    later put) fall back to the higher table timestamp.
//!
//! [`latest_only`] then keeps the first entry of every key and drains the
//! rest.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::iter::Peekable;

use crate::sstable::{SSTable, TableEntry};

// ------------------------------------------------------------------------------------------------
// MergeEntry
// ------------------------------------------------------------------------------------------------

/// Where the version of a key lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Held in the memtable. `None` is a tombstone.
    Memory(Option<Vec<u8>>),

    /// Indexed by an SSTable.
    Disk(TableEntry),
}

/// One version of one key flowing through a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEntry {
    pub key: u64,
    pub slot: Slot,

    /// Timestamp of the table the entry came from; `u64::MAX` for memory.
    pub timestamp: u64,
}

impl MergeEntry {
    pub fn memory(key: u64, value: Option<Vec<u8>>) -> Self {
        Self {
            key,
            slot: Slot::Memory(value),
            timestamp: u64::MAX,
        }
    }

    pub fn disk(entry: TableEntry, timestamp: u64) -> Self {
        Self {
            key: entry.key,
            slot: Slot::Disk(entry),
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        match &self.slot {
            Slot::Memory(value) => value.is_none(),
            Slot::Disk(entry) => entry.is_tombstone(),
        }
    }

    /// `Less` means `self` pops first.
    fn merge_cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| match (&self.slot, &other.slot) {
                (Slot::Memory(_), Slot::Memory(_)) => Ordering::Equal,
                (Slot::Memory(_), Slot::Disk(_)) => Ordering::Less,
                (Slot::Disk(_), Slot::Memory(_)) => Ordering::Greater,
                (Slot::Disk(a), Slot::Disk(b)) => b
                    .offset
                    .cmp(&a.offset)
                    .then_with(|| other.timestamp.cmp(&self.timestamp)),
            })
    }
}

// ------------------------------------------------------------------------------------------------
// MergeIterator
// ------------------------------------------------------------------------------------------------

/// A boxed sorted source.
pub type Source<'a> = Box<dyn Iterator<Item = MergeEntry> + 'a>;

/// Yields every entry of every source in merge order.
pub struct MergeIterator<'a> {
    sources: Vec<Source<'a>>,
    heap: BinaryHeap<HeapEntry>,
}

struct HeapEntry {
    entry: MergeEntry,
    source_idx: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the winning entry is on top.
        self.entry
            .merge_cmp(&other.entry)
            .then_with(|| self.source_idx.cmp(&other.source_idx))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl<'a> MergeIterator<'a> {
    pub fn new(mut sources: Vec<Source<'a>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next() {
                heap.push(HeapEntry {
                    entry,
                    source_idx: idx,
                });
            }
        }
        Self { sources, heap }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = MergeEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let HeapEntry { entry, source_idx } = self.heap.pop()?;
        if let Some(next) = self.sources[source_idx].next() {
            self.heap.push(HeapEntry {
                entry: next,
                source_idx,
            });
        }
        Some(entry)
    }
}

// ------------------------------------------------------------------------------------------------
// Latest-version filter
// ------------------------------------------------------------------------------------------------

/// Keeps the first (newest) entry of each key from a merge-ordered stream.
pub struct LatestOnly<I: Iterator<Item = MergeEntry>> {
    inner: Peekable<I>,
}

impl<I: Iterator<Item = MergeEntry>> Iterator for LatestOnly<I> {
    type Item = MergeEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let winner = self.inner.next()?;
        while self.inner.next_if(|e| e.key == winner.key).is_some() {}
        Some(winner)
    }
}

pub fn latest_only<I: Iterator<Item = MergeEntry>>(iter: I) -> LatestOnly<I> {
    LatestOnly {
        inner: iter.peekable(),
    }
}

// ------------------------------------------------------------------------------------------------
// Tracks
// ------------------------------------------------------------------------------------------------

/// Greedily packs tables into tracks of non-overlapping tables.
///
/// Tables are taken in ascending `min_key` order and appended to the first
/// track whose last table ends before the new table starts.
pub fn pack_tracks<'a>(mut tables: Vec<&'a SSTable>) -> Vec<Vec<&'a SSTable>> {
    tables.sort_by_key(|t| (t.min_key(), t.uid()));

    let mut tracks: Vec<Vec<&'a SSTable>> = Vec::new();
    for table in tables {
        let slot = tracks.iter_mut().find(|track| {
            track
                .last()
                .is_some_and(|last| last.max_key() < table.min_key())
        });
        match slot {
            Some(track) => track.push(table),
            None => tracks.push(vec![table]),
        }
    }
    tracks
}

/// Turns a track into a source restricted to `[lo, hi]`.
pub fn track_source<'a>(track: Vec<&'a SSTable>, lo: u64, hi: u64) -> Source<'a> {
    Box::new(track.into_iter().flat_map(move |table| {
        let ts = table.timestamp();
        table
            .range(lo, hi)
            .iter()
            .map(move |e| MergeEntry::disk(*e, ts))
    }))
}

/// Packs `tables` into tracks and returns one source per track.
pub fn table_sources<'a>(tables: Vec<&'a SSTable>, lo: u64, hi: u64) -> Vec<Source<'a>> {
    pack_tracks(tables)
        .into_iter()
        .map(|track| track_source(track, lo, hi))
        .collect()
}
