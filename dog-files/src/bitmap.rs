use serde::{Deserialize, Serialize};

/// Fixed-size bit-set recording which chunk indices have been durably received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageBitmap {
    words: Vec<u64>,
    len: u64,
    count: u64,
}

impl CoverageBitmap {
    /// Bitmap for `len` chunks, all unset
    pub fn new(len: u64) -> Self {
        let words = len.div_ceil(64) as usize;
        Self {
            words: vec![0; words],
            len,
            count: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == self.len
    }

    pub fn contains(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = Self::locate(index);
        self.words[word] & bit != 0
    }

    /// Set `index`; returns false when it was already set or out of range
    pub fn test_and_set(&mut self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = Self::locate(index);
        if self.words[word] & bit != 0 {
            return false;
        }
        self.words[word] |= bit;
        self.count += 1;
        true
    }

    /// Length of the run of set bits starting at index 0
    pub fn contiguous_prefix(&self) -> u64 {
        let mut prefix = 0;
        for word in &self.words {
            if *word == u64::MAX {
                prefix += 64;
                continue;
            }
            prefix += word.trailing_ones() as u64;
            break;
        }
        prefix.min(self.len)
    }

    /// Indices that are not yet set, in ascending order
    pub fn missing(&self) -> Vec<u64> {
        (0..self.len).filter(|index| !self.contains(*index)).collect()
    }

    fn locate(index: u64) -> (usize, u64) {
        ((index / 64) as usize, 1u64 << (index % 64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_set_counts_each_index_once() {
        let mut bitmap = CoverageBitmap::new(130);
        assert!(bitmap.test_and_set(0));
        assert!(!bitmap.test_and_set(0));
        assert!(bitmap.test_and_set(129));
        assert!(!bitmap.test_and_set(130));
        assert_eq!(bitmap.count(), 2);
        assert!(bitmap.contains(129));
        assert!(!bitmap.contains(64));
    }

    #[test]
    fn contiguous_prefix_crosses_word_boundaries() {
        let mut bitmap = CoverageBitmap::new(70);
        for index in 0..66 {
            bitmap.test_and_set(index);
        }
        bitmap.test_and_set(68);
        assert_eq!(bitmap.contiguous_prefix(), 66);
        assert_eq!(bitmap.missing(), vec![66, 67, 69]);

        for index in [66, 67, 69] {
            bitmap.test_and_set(index);
        }
        assert!(bitmap.is_full());
        assert_eq!(bitmap.contiguous_prefix(), 70);
    }
}
