//! Bloom filter contract tests: no false negatives, exact bitmap size,
//! serialization round trip and constructor validation.

#[cfg(test)]
mod tests {
    use crate::bloom::{BloomError, BloomFilter};

    /// # Scenario
    /// Every inserted key must be reported as possibly present.
    ///
    /// # Expected behavior
    /// `may_contain` returns `true` for all 2 000 inserted keys.
    #[test]
    fn no_false_negatives() {
        let mut bf = BloomFilter::new(65536, 4).unwrap();
        let keys: Vec<u64> = (0..2000u64).map(|i| i * 7919 + 3).collect();
        for &k in &keys {
            bf.insert(k);
        }
        for &k in &keys {
            assert!(bf.may_contain(k), "false negative for key {k}");
        }
    }

    /// # Scenario
    /// An empty filter rejects everything.
    #[test]
    fn empty_filter_contains_nothing() {
        let bf = BloomFilter::new(4096, 3).unwrap();
        for k in 0..1000u64 {
            assert!(!bf.may_contain(k));
        }
    }

    /// # Scenario
    /// A lightly loaded large filter should mostly reject absent keys.
    ///
    /// # Expected behavior
    /// Fewer than 5% false positives over 10 000 probes of absent keys.
    #[test]
    fn false_positive_rate_is_low_when_sparse() {
        let mut bf = BloomFilter::new(65536, 4).unwrap();
        for k in 0..1000u64 {
            bf.insert(k);
        }
        let fp = (1_000_000u64..1_010_000)
            .filter(|&k| bf.may_contain(k))
            .count();
        assert!(fp < 500, "too many false positives: {fp}");
    }

    #[test]
    fn bitmap_is_exactly_m_over_8_bytes() {
        let bf = BloomFilter::new(65536, 2).unwrap();
        assert_eq!(bf.as_bytes().len(), 8192);
        let bf = BloomFilter::new(4096, 1).unwrap();
        assert_eq!(bf.as_bytes().len(), 512);
    }

    /// # Scenario
    /// Serialize a populated filter and rebuild it from the bytes.
    ///
    /// # Expected behavior
    /// The rebuilt filter is equal and still answers every inserted key.
    #[test]
    fn from_bytes_restores_membership() {
        let mut bf = BloomFilter::new(8192, 3).unwrap();
        for k in [1u64, 42, 9_999, u64::MAX] {
            bf.insert(k);
        }
        let restored = BloomFilter::from_bytes(bf.as_bytes(), 8192, 3).unwrap();
        assert_eq!(restored, bf);
        for k in [1u64, 42, 9_999, u64::MAX] {
            assert!(restored.may_contain(k));
        }
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        let err = BloomFilter::from_bytes(&[0u8; 10], 8192, 3).unwrap_err();
        assert!(matches!(
            err,
            BloomError::SizeMismatch {
                expected: 1024,
                actual: 10
            }
        ));
    }

    #[test]
    fn constructor_validates_parameters() {
        assert!(matches!(
            BloomFilter::new(0, 1),
            Err(BloomError::InvalidBits(0))
        ));
        assert!(matches!(
            BloomFilter::new(100, 1),
            Err(BloomError::InvalidBits(100))
        ));
        assert!(matches!(
            BloomFilter::new(64, 0),
            Err(BloomError::InvalidHashes)
        ));
    }

    /// # Scenario
    /// Inserting a key sets at most `k` bits, stored MSB-first.
    #[test]
    fn insert_sets_at_most_k_bits() {
        let mut bf = BloomFilter::new(1024, 3).unwrap();
        bf.insert(12345);
        let set: u32 = bf.as_bytes().iter().map(|b| b.count_ones()).sum();
        assert!((1..=3).contains(&set));
    }
}
