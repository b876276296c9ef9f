use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Backing strategy used to track which ids of a pool are available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// Scan a bitmap for the lowest free id.
    #[default]
    Bitmap,
    /// Hand ids out in release order.
    FreeList,
}

/// Availability set over the local index space `0..len`.
pub(crate) enum FreeSet {
    Bitmap {
        // A set bit means the index is free.
        words: Vec<u64>,
        len: usize,
        free: usize,
    },
    FreeList {
        order: VecDeque<usize>,
        present: Vec<bool>,
    },
}

impl FreeSet {
    pub(crate) fn new(strategy: PoolStrategy, len: usize) -> Self {
        match strategy {
            PoolStrategy::Bitmap => {
                let mut words = vec![0u64; len.div_ceil(64)];
                for idx in 0..len {
                    words[idx / 64] |= 1u64 << (idx % 64);
                }
                FreeSet::Bitmap {
                    words,
                    len,
                    free: len,
                }
            }
            PoolStrategy::FreeList => FreeSet::FreeList {
                order: (0..len).collect(),
                present: vec![true; len],
            },
        }
    }

    pub(crate) fn available(&self) -> usize {
        match self {
            FreeSet::Bitmap { free, .. } => *free,
            FreeSet::FreeList { order, .. } => order.len(),
        }
    }

    pub(crate) fn is_free(&self, idx: usize) -> bool {
        match self {
            FreeSet::Bitmap { words, len, .. } => {
                idx < *len && words[idx / 64] & (1u64 << (idx % 64)) != 0
            }
            FreeSet::FreeList { present, .. } => present.get(idx).copied().unwrap_or(false),
        }
    }

    /// Take any free index.
    pub(crate) fn take_any(&mut self) -> Option<usize> {
        match self {
            FreeSet::Bitmap { words, len, free } => {
                for (word_idx, word) in words.iter_mut().enumerate() {
                    if *word == 0 {
                        continue;
                    }
                    let bit = word.trailing_zeros() as usize;
                    let idx = word_idx * 64 + bit;
                    if idx >= *len {
                        return None;
                    }
                    *word &= !(1u64 << bit);
                    *free -= 1;
                    return Some(idx);
                }
                None
            }
            FreeSet::FreeList { order, present } => {
                let idx = order.pop_front()?;
                present[idx] = false;
                Some(idx)
            }
        }
    }

    /// Take a specific index; returns false when it is not free.
    pub(crate) fn take(&mut self, idx: usize) -> bool {
        if !self.is_free(idx) {
            return false;
        }
        match self {
            FreeSet::Bitmap { words, free, .. } => {
                words[idx / 64] &= !(1u64 << (idx % 64));
                *free -= 1;
            }
            FreeSet::FreeList { order, present } => {
                present[idx] = false;
                if let Some(pos) = order.iter().position(|candidate| *candidate == idx) {
                    order.remove(pos);
                }
            }
        }
        true
    }

    /// Return an index to the set; returns false when it was already free.
    pub(crate) fn put(&mut self, idx: usize) -> bool {
        match self {
            FreeSet::Bitmap { words, len, free } => {
                if idx >= *len {
                    return false;
                }
                let mask = 1u64 << (idx % 64);
                if words[idx / 64] & mask != 0 {
                    return false;
                }
                words[idx / 64] |= mask;
                *free += 1;
                true
            }
            FreeSet::FreeList { order, present } => match present.get_mut(idx) {
                Some(slot) if !*slot => {
                    *slot = true;
                    order.push_back(idx);
                    true
                }
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_hands_out_lowest_first() {
        let mut set = FreeSet::new(PoolStrategy::Bitmap, 70);
        assert_eq!(set.take_any(), Some(0));
        assert_eq!(set.take_any(), Some(1));
        assert!(set.put(0));
        assert_eq!(set.take_any(), Some(0));
        assert_eq!(set.available(), 68);
    }

    #[test]
    fn bitmap_crosses_word_boundary() {
        let mut set = FreeSet::new(PoolStrategy::Bitmap, 65);
        for expected in 0..65 {
            assert_eq!(set.take_any(), Some(expected));
        }
        assert_eq!(set.take_any(), None);
        assert!(set.put(64));
        assert!(set.is_free(64));
        assert_eq!(set.take_any(), Some(64));
    }

    #[test]
    fn free_list_recycles_in_release_order() {
        let mut set = FreeSet::new(PoolStrategy::FreeList, 3);
        let a = set.take_any().unwrap();
        let b = set.take_any().unwrap();
        assert!(set.put(b));
        assert!(set.put(a));
        assert_eq!(set.take_any(), Some(2));
        assert_eq!(set.take_any(), Some(b));
        assert_eq!(set.take_any(), Some(a));
    }

    #[test]
    fn double_put_is_rejected() {
        for strategy in [PoolStrategy::Bitmap, PoolStrategy::FreeList] {
            let mut set = FreeSet::new(strategy, 4);
            assert!(!set.put(1));
            assert!(set.take(1));
            assert!(!set.take(1));
            assert!(set.put(1));
            assert!(!set.put(1));
            assert_eq!(set.available(), 4);
        }
    }
}
