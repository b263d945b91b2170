//! SSTable writer: turns sorted index entries into table files.
//!
//! [`SstWriter`] writes a single table. [`write_run`] splits an arbitrarily
//! long sorted stream into as many tables as the layout requires, which is
//! how both memtable flushes and compaction outputs are produced.
//!
//! # Input Requirements
//!
//! Entries **must be strictly ascending by key**. Violations are rejected
//! with [`SSTableError::Internal`] before anything touches the disk.
//!
//! # Atomicity
//!
//! 1. Write everything to `<uid>.sst.tmp`.
//! 2. Flush and (optionally) sync the file.
//! 3. Rename `<uid>.sst.tmp` to `<uid>.sst`.
//!
//! A crash cannot produce a partially-written table under its final name.

use std::{
    fs::{self, OpenOptions, rename},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::encoding::{self, Encode};

use super::{
    SST_HEADER_SIZE, SST_TMP_EXTENSION, SSTable, SSTableError, SSTableHeader, TableEntry,
    TableLayout, table_file_name,
};

// ------------------------------------------------------------------------------------------------
// SstWriter
// ------------------------------------------------------------------------------------------------

/// Writes one table file.
///
/// # Example
///
/// ```rust,ignore
/// let (header, bloom) = SstWriter::new(&path, layout, true).build(ts, &entries)?;
/// ```
pub struct SstWriter<P: AsRef<Path>> {
    path: P,
    layout: TableLayout,
    sync: bool,
}

impl<P: AsRef<Path>> SstWriter<P> {
    /// Create a writer targeting the given output path.
    pub fn new(path: P, layout: TableLayout, sync: bool) -> Self {
        Self { path, layout, sync }
    }

    /// Writes `entries` as one table with the given `timestamp`.
    ///
    /// Returns the header and Bloom filter that were written, so the caller
    /// can register the table without reading it back.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::Internal`] if `entries` is empty, exceeds the
    ///   layout's entry limit or is not strictly ascending.
    /// - I/O errors from writing, syncing or renaming.
    pub fn build(
        self,
        timestamp: u64,
        entries: &[TableEntry],
    ) -> Result<(SSTableHeader, BloomFilter), SSTableError> {
        let (min_key, max_key) = match (entries.first(), entries.last()) {
            (Some(f), Some(l)) => (f.key, l.key),
            _ => {
                return Err(SSTableError::Internal(
                    "Empty entry list cannot build SSTable".into(),
                ));
            }
        };
        if entries.len() > self.layout.max_entries() {
            return Err(SSTableError::Internal(format!(
                "{} entries exceed the per-table limit of {}",
                entries.len(),
                self.layout.max_entries()
            )));
        }
        if entries.windows(2).any(|w| w[0].key >= w[1].key) {
            return Err(SSTableError::Internal(
                "SSTable entries must be strictly ascending".into(),
            ));
        }

        let mut bloom = BloomFilter::new(self.layout.bloom_bits, self.layout.bloom_hashes)
            .map_err(|e| SSTableError::Internal(e.to_string()))?;
        for entry in entries {
            bloom.insert(entry.key);
        }

        let header = SSTableHeader {
            timestamp,
            kv_num: entries.len() as u64,
            min_key,
            max_key,
        };

        let mut buf = Vec::with_capacity(self.layout.file_size(header.kv_num) as usize);
        header.encode_to(&mut buf)?;
        debug_assert_eq!(buf.len(), SST_HEADER_SIZE);
        buf.extend_from_slice(bloom.as_bytes());
        encoding::encode_seq(entries, &mut buf)?;

        // Open temp file for atomic write.
        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension(SST_TMP_EXTENSION);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        {
            let mut writer = BufWriter::new(&mut file);
            writer.write_all(&buf)?;
            writer.flush()?;
        }
        if self.sync {
            file.sync_all()?;
        }
        drop(file);

        rename(&tmp_path, final_path)?;

        debug!(
            path = %final_path.display(),
            timestamp,
            kv_num = header.kv_num,
            min_key,
            max_key,
            "Wrote SSTable"
        );
        Ok((header, bloom))
    }
}

// ------------------------------------------------------------------------------------------------
// Runs of tables
// ------------------------------------------------------------------------------------------------

/// Splits a sorted entry stream into tables of at most
/// [`TableLayout::max_entries`] entries and writes them under `dir`.
///
/// `alloc` is called once per table and returns its `(uid, timestamp)`.
/// If any table fails to write, the tables already written by this call are
/// removed again and the error is returned.
pub fn write_run<I, F>(
    dir: &Path,
    layout: &TableLayout,
    sync: bool,
    entries: I,
    mut alloc: F,
) -> Result<Vec<SSTable>, SSTableError>
where
    I: IntoIterator<Item = TableEntry>,
    F: FnMut() -> (u64, u64),
{
    let chunk_size = layout.max_entries();
    if chunk_size == 0 {
        return Err(SSTableError::Internal(
            "table layout leaves no room for entries".into(),
        ));
    }

    let mut written: Vec<SSTable> = Vec::new();
    let mut chunk: Vec<TableEntry> = Vec::with_capacity(chunk_size);
    let mut entries = entries.into_iter().peekable();

    while entries.peek().is_some() {
        chunk.clear();
        chunk.extend(entries.by_ref().take(chunk_size));

        let (uid, timestamp) = alloc();
        let path: PathBuf = dir.join(table_file_name(uid));

        match SstWriter::new(&path, *layout, sync).build(timestamp, &chunk) {
            Ok((header, bloom)) => {
                written.push(SSTable::from_parts(uid, path, header, bloom, chunk.clone()));
            }
            Err(e) => {
                for table in &written {
                    if let Err(rm) = fs::remove_file(table.path()) {
                        warn!(path = %table.path().display(), error = %rm, "Failed to remove partial run output");
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(written)
}
