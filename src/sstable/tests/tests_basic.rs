//! SSTable build / open / format-verification tests.
//!
//! These tests exercise the table lifecycle: writing a file from sorted
//! entries, re-opening it, and checking every byte region of the layout
//! (header, Bloom bitmap, entry array).
//!
//! ## See also
//! - [`tests_find`]: point lookups and range slices
//! - [`tests_corruption`]: rejection of malformed files

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::bloom::BloomFilter;
    use crate::sstable::builder::SstWriter;
    use crate::sstable::{
        SST_ENTRY_SIZE, SST_HEADER_SIZE, SSTable, SSTableError, TableEntry, TableLayout,
        parse_table_uid, table_file_name,
    };
    use std::fs;
    use tempfile::TempDir;

    fn layout() -> TableLayout {
        TableLayout {
            bloom_bits: 1024,
            bloom_hashes: 3,
            max_table_bytes: 4096,
        }
    }

    fn entries(keys: &[u64]) -> Vec<TableEntry> {
        keys.iter()
            .map(|&k| TableEntry {
                key: k,
                offset: k * 100,
                vlen: (k % 7) as u32 + 1,
            })
            .collect()
    }

    /// Default sizing: 32 KiB tables with a 65 536-bit filter hold
    /// `(32768 - 32 - 8192) / 20 = 1227` entries.
    #[test]
    fn layout__max_entries_formula() {
        let l = TableLayout {
            bloom_bits: 65536,
            bloom_hashes: 4,
            max_table_bytes: 32 * 1024,
        };
        assert_eq!(l.bloom_bytes(), 8192);
        assert_eq!(l.max_entries(), 1227);
        assert_eq!(layout().max_entries(), (4096 - 32 - 128) / 20);
    }

    #[test]
    fn layout__too_small_budget_gives_zero_entries() {
        let l = TableLayout {
            bloom_bits: 8192,
            bloom_hashes: 1,
            max_table_bytes: 100,
        };
        assert_eq!(l.max_entries(), 0);
    }

    /// # Scenario
    /// Build a table and open it again.
    ///
    /// # Expected behavior
    /// Header, entries and timestamp survive; the file length is exactly
    /// `32 + m/8 + 20 * kv_num`.
    #[test]
    fn build_open__round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(table_file_name(7));
        let input = entries(&[3, 5, 8, 13, 21]);

        let (header, _) = SstWriter::new(&path, layout(), true)
            .build(42, &input)
            .unwrap();
        assert_eq!(header.kv_num, 5);
        assert_eq!((header.min_key, header.max_key), (3, 21));

        let sst = SSTable::open(&path, 7, &layout()).unwrap();
        assert_eq!(sst.uid(), 7);
        assert_eq!(sst.timestamp(), 42);
        assert_eq!(sst.entries(), input.as_slice());
        assert_eq!(sst.header(), &header);

        let len = fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, SST_HEADER_SIZE + 128 + 5 * SST_ENTRY_SIZE);
        assert!(!tmp.path().join("7.sst.tmp").exists());
    }

    /// # Scenario
    /// Inspect the raw bytes of a one-entry table.
    ///
    /// # Expected behavior
    /// Little-endian header fields, an m/8-byte bitmap matching a filter built
    /// over the key, then `key, offset, vlen`.
    #[test]
    fn build__byte_layout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("1.sst");
        let entry = TableEntry {
            key: 0xAABB,
            offset: 0x1122_3344,
            vlen: 9,
        };
        SstWriter::new(&path, layout(), false)
            .build(5, &[entry])
            .unwrap();

        let raw = fs::read(&path).unwrap();
        assert_eq!(&raw[0..8], &5u64.to_le_bytes());
        assert_eq!(&raw[8..16], &1u64.to_le_bytes());
        assert_eq!(&raw[16..24], &0xAABBu64.to_le_bytes());
        assert_eq!(&raw[24..32], &0xAABBu64.to_le_bytes());

        let mut expected_bloom = BloomFilter::new(1024, 3).unwrap();
        expected_bloom.insert(0xAABB);
        assert_eq!(&raw[32..160], expected_bloom.as_bytes());

        assert_eq!(&raw[160..168], &0xAABBu64.to_le_bytes());
        assert_eq!(&raw[168..176], &0x1122_3344u64.to_le_bytes());
        assert_eq!(&raw[176..180], &9u32.to_le_bytes());
        assert_eq!(raw.len(), 180);
    }

    /// Bloom filter of a built table reports every stored key.
    #[test]
    fn build__bloom_has_no_false_negatives() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("2.sst");
        let keys: Vec<u64> = (0..180u64).map(|i| i * 31 + 1).collect();
        SstWriter::new(&path, layout(), false)
            .build(1, &entries(&keys))
            .unwrap();

        let sst = SSTable::open(&path, 2, &layout()).unwrap();
        for k in keys {
            assert!(sst.bloom().may_contain(k), "false negative for {k}");
        }
    }

    #[test]
    fn build__rejects_empty_input() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("3.sst");
        let err = SstWriter::new(&path, layout(), false)
            .build(1, &[])
            .unwrap_err();
        assert!(matches!(err, SSTableError::Internal(_)));
        assert!(!path.exists());
    }

    #[test]
    fn build__rejects_unsorted_or_duplicate_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("4.sst");
        assert!(matches!(
            SstWriter::new(&path, layout(), false).build(1, &entries(&[2, 1])),
            Err(SSTableError::Internal(_))
        ));
        assert!(matches!(
            SstWriter::new(&path, layout(), false).build(1, &entries(&[1, 1])),
            Err(SSTableError::Internal(_))
        ));
    }

    #[test]
    fn build__rejects_more_than_max_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("5.sst");
        let keys: Vec<u64> = (0..=layout().max_entries() as u64).collect();
        assert!(matches!(
            SstWriter::new(&path, layout(), false).build(1, &entries(&keys)),
            Err(SSTableError::Internal(_))
        ));
    }

    #[test]
    fn file_name__parse_round_trip() {
        let name = table_file_name(123);
        assert_eq!(name, "123.sst");
        assert_eq!(parse_table_uid(std::path::Path::new(&name)), Some(123));
        assert_eq!(parse_table_uid(std::path::Path::new("123.sst.tmp")), None);
        assert_eq!(parse_table_uid(std::path::Path::new("abc.sst")), None);
        assert_eq!(parse_table_uid(std::path::Path::new("vlog")), None);
    }
}
