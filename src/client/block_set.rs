use std::collections::BTreeSet;

use crate::client::BLOCK_SIZE;

/// Number of `BLOCK_SIZE` blocks needed to cover `size` bytes, `None` when block
/// indices of such a file would not fit the int32 wire fields.
pub fn block_count(size: u64) -> Option<u32> {
    u32::try_from(size.div_ceil(BLOCK_SIZE)).ok()
}

/// Owned block indices of one file, out of `total`.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct BlockSet {
    owned: BTreeSet<u32>,
    total: u32,
}

impl BlockSet {
    pub fn empty(total: u32) -> Self {
        BlockSet {
            owned: BTreeSet::new(),
            total,
        }
    }

    pub fn full(total: u32) -> Self {
        BlockSet {
            owned: (0..total).collect(),
            total,
        }
    }

    /// Indices outside `[0, total)` are dropped.
    pub fn from_owned(owned: impl IntoIterator<Item = u32>, total: u32) -> Self {
        BlockSet {
            owned: owned.into_iter().filter(|idx| *idx < total).collect(),
            total,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn owned(&self) -> impl Iterator<Item = u32> + '_ {
        self.owned.iter().copied()
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    pub fn contains(&self, block_idx: u32) -> bool {
        self.owned.contains(&block_idx)
    }

    /// Returns false if the block was already owned or is out of range.
    pub fn insert(&mut self, block_idx: u32) -> bool {
        block_idx < self.total && self.owned.insert(block_idx)
    }

    /// Blocks in `[0, total)` that are not owned, ascending.
    pub fn complement(&self) -> Vec<u32> {
        self.missing().collect()
    }

    /// Lazy `complement`: walks the gaps between owned indices, so taking the first
    /// few missing blocks never materializes the whole range.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        let mut next = 0u32;
        self.owned
            .iter()
            .copied()
            .chain(std::iter::once(self.total))
            .flat_map(move |end| {
                let gap = next..end;
                next = end.saturating_add(1);
                gap
            })
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.owned.len() == self.total as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(block_count(0), Some(0));
        assert_eq!(block_count(1), Some(1));
        assert_eq!(block_count(100), Some(1));
        assert_eq!(block_count(101), Some(2));
        assert_eq!(block_count(250), Some(3));
    }

    #[test]
    fn block_count_refuses_files_beyond_int32_indices() {
        let largest = u32::MAX as u64 * BLOCK_SIZE;
        assert_eq!(block_count(largest), Some(u32::MAX));
        assert_eq!(block_count(largest + 1), None);
        assert_eq!(block_count(u64::MAX), None);
    }

    #[test]
    fn missing_walks_gaps_lazily() {
        let blocks = BlockSet::from_owned([0, 1, 4, 5, 9], 10);
        assert_eq!(blocks.missing().collect::<Vec<_>>(), vec![2, 3, 6, 7, 8]);
        assert_eq!(blocks.missing().take(2).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(BlockSet::full(4).missing().count(), 0);
        assert_eq!(BlockSet::empty(0).missing().count(), 0);

        let huge = BlockSet::from_owned([0], u32::MAX);
        assert_eq!(huge.missing().take(3).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn full_and_empty_complements() {
        let total = block_count(250).unwrap();
        let full = BlockSet::full(total);
        assert_eq!(full.owned().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(full.complement().is_empty());
        assert!(full.is_complete());

        let empty = BlockSet::empty(total);
        assert!(empty.is_empty());
        assert_eq!(empty.complement(), vec![0, 1, 2]);
    }

    #[test]
    fn insert_is_idempotent_and_bounded() {
        let mut blocks = BlockSet::empty(3);
        assert!(blocks.insert(1));
        assert!(!blocks.insert(1));
        assert!(!blocks.insert(3));
        assert_eq!(blocks.owned().collect::<Vec<_>>(), vec![1]);
        assert_eq!(blocks.complement(), vec![0, 2]);
    }

    #[test]
    fn out_of_range_indices_are_dropped_on_construction() {
        let blocks = BlockSet::from_owned([0, 2, 9], 3);
        assert_eq!(blocks.owned_count(), 2);
        assert_eq!(blocks.complement(), vec![1]);
    }
}
