//! Point lookups (`find`) and range slices over a single table.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::sstable::builder::SstWriter;
    use crate::sstable::{SSTable, TableEntry, TableLayout};
    use tempfile::TempDir;

    fn layout() -> TableLayout {
        TableLayout {
            bloom_bits: 2048,
            bloom_hashes: 4,
            max_table_bytes: 8192,
        }
    }

    fn open_table(tmp: &TempDir, entries: &[TableEntry]) -> SSTable {
        let path = tmp.path().join("1.sst");
        SstWriter::new(&path, layout(), false)
            .build(1, entries)
            .unwrap();
        SSTable::open(&path, 1, &layout()).unwrap()
    }

    fn even_entries() -> Vec<TableEntry> {
        (0..100u64)
            .map(|i| TableEntry {
                key: i * 2,
                offset: i,
                vlen: if i % 10 == 0 { 0 } else { 4 },
            })
            .collect()
    }

    #[test]
    fn find__hit_with_and_without_bloom() {
        let tmp = TempDir::new().unwrap();
        let sst = open_table(&tmp, &even_entries());

        for use_bloom in [true, false] {
            let e = sst.find(42, use_bloom).unwrap();
            assert_eq!(e.key, 42);
            assert_eq!(e.offset, 21);
        }
    }

    #[test]
    fn find__miss_inside_range() {
        let tmp = TempDir::new().unwrap();
        let sst = open_table(&tmp, &even_entries());
        assert_eq!(sst.find(43, true), None);
        assert_eq!(sst.find(43, false), None);
    }

    #[test]
    fn find__miss_outside_range() {
        let tmp = TempDir::new().unwrap();
        let sst = open_table(&tmp, &even_entries());
        assert!(!sst.covers(1000));
        assert_eq!(sst.find(1000, false), None);
    }

    /// Tombstones are returned as entries with `vlen == 0`.
    #[test]
    fn find__returns_tombstone_entry() {
        let tmp = TempDir::new().unwrap();
        let sst = open_table(&tmp, &even_entries());
        let e = sst.find(20, true).unwrap();
        assert!(e.is_tombstone());
    }

    #[test]
    fn range__inclusive_slice() {
        let tmp = TempDir::new().unwrap();
        let sst = open_table(&tmp, &even_entries());

        let keys: Vec<u64> = sst.range(9, 16).iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![10, 12, 14, 16]);
        assert!(sst.range(17, 9).is_empty());
        assert_eq!(sst.range(0, u64::MAX).len(), 100);
    }

    #[test]
    fn overlaps__interval_checks() {
        let tmp = TempDir::new().unwrap();
        let sst = open_table(&tmp, &even_entries());
        assert_eq!((sst.min_key(), sst.max_key()), (0, 198));
        assert!(sst.overlaps(198, 500));
        assert!(sst.overlaps(50, 60));
        assert!(!sst.overlaps(199, 500));
    }
}
