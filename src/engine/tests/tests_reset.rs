//! `reset` wipes keys, tables and the value log.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::tests::helpers::*;
    use crate::engine::VLOG_FILE_NAME;
    use crate::sstable;
    use std::fs;
    use tempfile::TempDir;

    /// # Scenario
    /// Reset after enough writes to populate several levels.
    ///
    /// # Expected behavior
    /// No key is readable, no level directory remains, the log is empty and
    /// the engine accepts (and persists) new writes afterwards.
    #[test]
    fn reset__wipes_everything() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_keys(tmp.path(), 0..60);
        assert!(engine.stats().unwrap().table_count() > 0);

        engine.reset().unwrap();

        for k in 0..60u64 {
            assert_eq!(engine.get(k).unwrap(), None);
        }
        assert!(engine.scan(0, u64::MAX).unwrap().is_empty());

        let stats = engine.stats().unwrap();
        assert_eq!(stats.memtable_len, 0);
        assert_eq!(stats.table_count(), 0);
        assert_eq!((stats.vlog_head, stats.vlog_tail), (0, 0));

        let level_dirs = fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| sstable::parse_level_dir(&e.as_ref().unwrap().path()).is_some())
            .count();
        assert_eq!(level_dirs, 0);
        assert_eq!(fs::metadata(tmp.path().join(VLOG_FILE_NAME)).unwrap().len(), 0);

        engine.put(3, value_for(3)).unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = reopen(tmp.path());
        assert_eq!(engine.get(3).unwrap(), Some(value_for(3)));
        assert_eq!(engine.get(4).unwrap(), None);
    }

    /// # Scenario
    /// Reset fails part way because the value log cannot be truncated.
    ///
    /// # Actions
    /// 1. Write keys `0..20` (two tables plus four buffered entries).
    /// 2. Replace the log file with a directory and call `reset`.
    /// 3. Restore a plain file and call `reset` again.
    ///
    /// # Expected behavior
    /// The failed call keeps the memtable and catalog intact; the retry
    /// clears both.
    #[test]
    fn reset__failure_keeps_in_memory_state() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_keys(tmp.path(), 0..20);
        let before = engine.stats().unwrap();
        assert_eq!(before.memtable_len, 4);
        assert!(before.table_count() > 0);

        let log = tmp.path().join(VLOG_FILE_NAME);
        fs::remove_file(&log).unwrap();
        fs::create_dir(&log).unwrap();

        assert!(engine.reset().is_err());
        let after = engine.stats().unwrap();
        assert_eq!(after.memtable_len, before.memtable_len);
        assert_eq!(after.tables_per_level, before.tables_per_level);
        assert_eq!(engine.get(19).unwrap(), Some(value_for(19)));

        fs::remove_dir(&log).unwrap();
        engine.reset().unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.memtable_len, 0);
        assert_eq!(stats.table_count(), 0);
        assert_eq!(engine.get(19).unwrap(), None);
    }
}
