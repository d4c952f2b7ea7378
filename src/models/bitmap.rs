use serde::{Deserialize, Serialize};

/// Dependency bitmap: one bit per blocking FwdDep of the current execution generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepMap {
    size: u32,
    words: Vec<u64>,
}

impl DepMap {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            words: vec![0; (size as usize).div_ceil(64)],
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Set `bit`. Returns false when the bit is out of range.
    pub fn set(&mut self, bit: u32) -> bool {
        if bit >= self.size {
            return false;
        }
        self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        true
    }

    pub fn is_set(&self, bit: u32) -> bool {
        bit < self.size && self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// True when every bit is set. Vacuously true for an empty map.
    pub fn all_set(&self) -> bool {
        self.count_set() == self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Drop all bits; the next execution generation starts without dependencies.
    pub fn clear(&mut self) {
        self.size = 0;
        self.words.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_map() {
        let map = DepMap::default();
        assert!(map.is_empty());
        assert!(map.all_set());
        assert_eq!(map.count_set(), 0);
    }

    #[test]
    fn test_set_and_clear() {
        let mut map = DepMap::new(3);
        assert!(!map.all_set());
        assert!(map.set(0));
        assert!(map.set(2));
        assert!(!map.set(3));
        assert!(map.is_set(2));
        assert!(!map.is_set(1));
        assert!(map.set(1));
        assert!(map.all_set());

        map.clear();
        assert!(map.is_empty());
        assert!(!map.set(0));
    }

    proptest! {
        #[test]
        fn prop_count_tracks_distinct_bits(size in 1u32..300, bits in proptest::collection::vec(0u32..300, 0..400)) {
            let mut map = DepMap::new(size);
            let mut expected = std::collections::BTreeSet::new();
            for bit in bits {
                if map.set(bit) {
                    expected.insert(bit);
                }
            }
            prop_assert_eq!(map.count_set() as usize, expected.len());
            prop_assert_eq!(map.all_set(), expected.len() == size as usize);
            for bit in expected {
                prop_assert!(map.is_set(bit));
            }
        }
    }
}
