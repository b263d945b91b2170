//! Sorted Table (SSTable) Module
//!
//! Immutable, disk-backed sorted runs of `(key, offset, vlen)` index entries.
//! Values themselves live in the value log; a table only records where each
//! key's value starts and how long it is. A stored `vlen` of `0` marks a
//! tombstone.
//!
//! # On-disk layout
//!
//! ```text
//! [TIMESTAMP u64][KV_NUM u64][MIN_KEY u64][MAX_KEY u64]     header, 32 B
//! [BLOOM_BITMAP m/8 B]                                      MSB-first bits
//! [KEY u64][OFFSET u64][VLEN u32]  x KV_NUM                 20 B per entry
//! ```
//!
//! All integers are little-endian. Entries are strictly ascending by key,
//! `MIN_KEY` and `MAX_KEY` equal the first and last entry keys, and the
//! file is exactly `32 + m/8 + 20 * KV_NUM` bytes long.
//!
//! The number of entries per table is capped by the configured byte budget:
//!
//! ```text
//! max_entries = (max_table_bytes - 32 - m/8) / 20
//! ```
//!
//! # Sub-modules
//!
//! - [`builder`]: [`builder::SstWriter`] and [`write_run`] for producing tables.
//!
//! # Concurrency model
//!
//! Tables are immutable once written. [`SSTable::open`] decodes the whole
//! file into memory, so lookups never touch the disk again.
//!
//! # Crash safety
//!
//! Files are written to `<uid>.sst.tmp`, synced, then renamed to
//! `<uid>.sst`. A crash leaves at most a stale `.tmp` file, which the engine
//! removes on open.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Re-exports
// ------------------------------------------------------------------------------------------------

pub use builder::write_run;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{error, trace};

use crate::bloom::BloomFilter;
use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Size of the fixed table header.
pub const SST_HEADER_SIZE: usize = 32;

/// Size of one `(key, offset, vlen)` entry.
pub const SST_ENTRY_SIZE: usize = 20;

/// Extension of finished table files.
pub const SST_EXTENSION: &str = "sst";

/// Extension of in-progress table files.
pub const SST_TMP_EXTENSION: &str = "sst.tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The file does not describe a valid table.
    #[error("Malformed SSTable {path}: {reason}")]
    Malformed {
        /// File that failed to decode.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Internal invariant violation (bad builder input).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Layout parameters
// ------------------------------------------------------------------------------------------------

/// Size parameters shared by every table of one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    /// Bloom filter size in bits (`m`).
    pub bloom_bits: u32,

    /// Bloom filter probe count (`k`).
    pub bloom_hashes: u32,

    /// Upper bound on a table file's size.
    pub max_table_bytes: u64,
}

impl TableLayout {
    /// Bytes taken by the serialized Bloom bitmap.
    pub fn bloom_bytes(&self) -> usize {
        (self.bloom_bits / 8) as usize
    }

    /// Maximum number of entries one table may hold.
    pub fn max_entries(&self) -> usize {
        let fixed = (SST_HEADER_SIZE + self.bloom_bytes()) as u64;
        (self.max_table_bytes.saturating_sub(fixed) / SST_ENTRY_SIZE as u64) as usize
    }

    /// Exact file size of a table holding `kv_num` entries.
    pub fn file_size(&self, kv_num: u64) -> u64 {
        (SST_HEADER_SIZE + self.bloom_bytes()) as u64 + kv_num * SST_ENTRY_SIZE as u64
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Fixed 32-byte table header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SSTableHeader {
    /// Generation counter; higher means newer.
    pub timestamp: u64,

    /// Number of entries.
    pub kv_num: u64,

    pub min_key: u64,
    pub max_key: u64,
}

impl Encode for SSTableHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.timestamp.encode_to(buf)?;
        self.kv_num.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTableHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (timestamp, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (kv_num, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (min_key, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (max_key, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                timestamp,
                kv_num,
                min_key,
                max_key,
            },
            off,
        ))
    }
}

/// One index entry: where the value of `key` lives in the value log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub key: u64,

    /// Offset of the value log record. For a tombstone, the log head at
    /// the time the tombstone was flushed.
    pub offset: u64,

    /// Value length; `0` marks a tombstone.
    pub vlen: u32,
}

impl TableEntry {
    pub fn is_tombstone(&self) -> bool {
        self.vlen == 0
    }
}

impl Encode for TableEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        self.vlen.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TableEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (key, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (vlen, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { key, offset, vlen }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// `level-<L>`
pub fn level_dir_name(level: usize) -> String {
    format!("level-{level}")
}

/// Extracts `L` from a `level-<L>` directory name.
pub fn parse_level_dir(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("level-")?.parse::<usize>().ok()
}

/// `<uid>.sst`
pub fn table_file_name(uid: u64) -> String {
    format!("{uid}.{SST_EXTENSION}")
}

/// Extracts the uid from a `<uid>.sst` path. Anything else yields `None`.
pub fn parse_table_uid(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".sst")?;
    stem.parse::<u64>().ok()
}

// ------------------------------------------------------------------------------------------------
// SSTable reader
// ------------------------------------------------------------------------------------------------

/// A fully decoded, immutable table.
#[derive(Debug, Clone)]
pub struct SSTable {
    /// Unique identifier, also the file stem.
    uid: u64,

    /// Location on disk.
    path: PathBuf,

    header: SSTableHeader,

    bloom: BloomFilter,

    /// All entries, strictly ascending by key.
    entries: Vec<TableEntry>,
}

impl SSTable {
    /// Opens a table file and decodes it completely.
    ///
    /// # Errors
    ///
    /// [`SSTableError::Malformed`] when the file length does not match
    /// `kv_num`, the table is empty, entries are not strictly ascending or the
    /// header's `min_key`/`max_key` disagree with the entries.
    pub fn open(path: impl AsRef<Path>, uid: u64, layout: &TableLayout) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        let file = File::open(path)?;

        // SAFETY: table files are never modified after the rename that
        // publishes them, and the map is dropped before this function returns.
        let mmap = unsafe { Mmap::map(&file)? };

        let malformed = |reason: String| {
            error!(path = %path.display(), %reason, "Malformed SSTable");
            SSTableError::Malformed {
                path: path.to_path_buf(),
                reason,
            }
        };

        let fixed = SST_HEADER_SIZE + layout.bloom_bytes();
        if mmap.len() < fixed {
            return Err(malformed(format!(
                "file is {} bytes, smaller than header and bloom ({fixed} bytes)",
                mmap.len()
            )));
        }

        let (header, _) = encoding::decode_from_slice::<SSTableHeader>(&mmap[..SST_HEADER_SIZE])?;

        let expected = layout.file_size(header.kv_num);
        if mmap.len() as u64 != expected {
            return Err(malformed(format!(
                "file is {} bytes, kv_num {} requires {expected}",
                mmap.len(),
                header.kv_num
            )));
        }
        if header.kv_num == 0 {
            return Err(malformed("table holds no entries".into()));
        }

        let bloom = BloomFilter::from_bytes(
            &mmap[SST_HEADER_SIZE..fixed],
            layout.bloom_bits,
            layout.bloom_hashes,
        )
        .map_err(|e| malformed(e.to_string()))?;

        let (entries, _) =
            encoding::decode_seq::<TableEntry>(&mmap[fixed..], header.kv_num as usize)?;

        if entries.windows(2).any(|w| w[0].key >= w[1].key) {
            return Err(malformed("entries are not strictly ascending".into()));
        }

        let (first, last) = match (entries.first(), entries.last()) {
            (Some(f), Some(l)) => (f.key, l.key),
            _ => return Err(malformed("table holds no entries".into())),
        };
        if first != header.min_key || last != header.max_key {
            return Err(malformed(format!(
                "header range [{}, {}] does not match entries [{first}, {last}]",
                header.min_key, header.max_key
            )));
        }

        trace!(uid, path = %path.display(), kv_num = header.kv_num, "Opened SSTable");

        Ok(Self {
            uid,
            path: path.to_path_buf(),
            header,
            bloom,
            entries,
        })
    }

    /// Assembles a table from parts already known to be consistent.
    pub(crate) fn from_parts(
        uid: u64,
        path: PathBuf,
        header: SSTableHeader,
        bloom: BloomFilter,
        entries: Vec<TableEntry>,
    ) -> Self {
        Self {
            uid,
            path,
            header,
            bloom,
            entries,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SSTableHeader {
        &self.header
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    pub fn min_key(&self) -> u64 {
        self.header.min_key
    }

    pub fn max_key(&self) -> u64 {
        self.header.max_key
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    /// Whether `key` falls inside `[min_key, max_key]`.
    pub fn covers(&self, key: u64) -> bool {
        self.header.min_key <= key && key <= self.header.max_key
    }

    /// Whether `[lo, hi]` intersects `[min_key, max_key]`.
    pub fn overlaps(&self, lo: u64, hi: u64) -> bool {
        lo <= self.header.max_key && self.header.min_key <= hi
    }

    /// Looks up `key`.
    ///
    /// With `use_bloom`, a negative Bloom answer short-circuits the binary
    /// search. The returned entry may be a tombstone.
    pub fn find(&self, key: u64, use_bloom: bool) -> Option<TableEntry> {
        if !self.covers(key) {
            return None;
        }
        if use_bloom && !self.bloom.may_contain(key) {
            return None;
        }
        self.entries
            .binary_search_by_key(&key, |e| e.key)
            .ok()
            .map(|idx| self.entries[idx])
    }

    /// Entries with `lo <= key <= hi`, in ascending order.
    pub fn range(&self, lo: u64, hi: u64) -> &[TableEntry] {
        if lo > hi {
            return &[];
        }
        let start = self.entries.partition_point(|e| e.key < lo);
        let end = self.entries.partition_point(|e| e.key <= hi);
        &self.entries[start..end]
    }
}
