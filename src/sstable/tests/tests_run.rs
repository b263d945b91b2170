//! `write_run`: chunking a sorted stream into several tables.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::sstable::{SSTable, TableEntry, TableLayout, table_file_name, write_run};
    use tempfile::TempDir;

    fn layout() -> TableLayout {
        // (32 + 64 + 20 * 5) = 196 -> five entries per table.
        TableLayout {
            bloom_bits: 512,
            bloom_hashes: 2,
            max_table_bytes: 196,
        }
    }

    fn stream(n: u64) -> impl Iterator<Item = TableEntry> {
        (0..n).map(|k| TableEntry {
            key: k,
            offset: k * 10,
            vlen: 3,
        })
    }

    /// # Scenario
    /// Write 12 entries with a limit of 5 per table.
    ///
    /// # Expected behavior
    /// Three tables of 5, 5 and 2 entries, with uids and timestamps drawn
    /// from the allocator in order, each readable from disk.
    #[test]
    fn run__chunks_by_max_entries() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(layout().max_entries(), 5);

        let mut next = 0u64;
        let tables = write_run(tmp.path(), &layout(), false, stream(12), || {
            next += 1;
            (next, 100 + next)
        })
        .unwrap();

        let sizes: Vec<usize> = tables.iter().map(|t| t.len()).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        let uids: Vec<u64> = tables.iter().map(|t| t.uid()).collect();
        assert_eq!(uids, vec![1, 2, 3]);
        assert_eq!(tables[2].timestamp(), 103);
        assert_eq!((tables[1].min_key(), tables[1].max_key()), (5, 9));

        for t in &tables {
            let reopened = SSTable::open(tmp.path().join(table_file_name(t.uid())), t.uid(), &layout()).unwrap();
            assert_eq!(reopened.entries(), t.entries());
        }
    }

    #[test]
    fn run__empty_stream_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let tables = write_run(tmp.path(), &layout(), false, stream(0), || (1, 1)).unwrap();
        assert!(tables.is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    /// A failing table removes the tables written earlier in the same run.
    #[test]
    fn run__failure_removes_partial_output() {
        let tmp = TempDir::new().unwrap();
        // Second chunk is not ascending relative to itself.
        let entries = vec![
            TableEntry { key: 1, offset: 0, vlen: 1 },
            TableEntry { key: 2, offset: 0, vlen: 1 },
            TableEntry { key: 3, offset: 0, vlen: 1 },
            TableEntry { key: 4, offset: 0, vlen: 1 },
            TableEntry { key: 5, offset: 0, vlen: 1 },
            TableEntry { key: 9, offset: 0, vlen: 1 },
            TableEntry { key: 8, offset: 0, vlen: 1 },
        ];
        let mut next = 0u64;
        let res = write_run(tmp.path(), &layout(), false, entries, || {
            next += 1;
            (next, 1)
        });
        assert!(res.is_err());
        assert!(!tmp.path().join("1.sst").exists());
    }
}
