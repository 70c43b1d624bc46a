/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Per-order shard indexing.
//!
//! A [`ShardIndexer`] buffers one order's worth of `(prefix node, word
//! run)` groups for a single shard, keyed by the prefix's node position, so
//! groups may arrive in any order as long as each prefix appears once. When
//! the order is sealed the runs are emitted in node-position order,
//! appending the ids, the `positions` runs and one payload per new node.

use super::Shard;
use crate::error::Error;
use crate::storage::PackedVec;
use crate::{Id, NONE};
use anyhow::Result;

/// Builds one order of one shard; `V` is the per-node payload (a raw count
/// during indexing, the value triple during reorganisation).
#[derive(Debug, Clone)]
pub struct ShardIndexer<V: Copy> {
    base: usize,
    positions_size: usize,
    ids: Vec<Id>,
    values: Vec<V>,
    runs: Vec<(usize, usize)>,
    /// Memo of the last prefix's parent node: consecutive groups of a
    /// sorted stream usually differ only in their final token.
    memo_key: Vec<Id>,
    memo_pos: usize,
}

impl<V: Copy> ShardIndexer<V> {
    /// Prepares to index order `shard.order() + 1`.
    pub fn new(shard: &Shard) -> Self {
        let order_prev = shard.order();
        let base = shard.offsets[order_prev - 1];
        let positions_size = shard.offsets[order_prev] - base;
        ShardIndexer {
            base,
            positions_size,
            ids: Vec::new(),
            values: Vec::new(),
            runs: vec![(0, 0); positions_size],
            memo_key: Vec::new(),
            memo_pos: NONE,
        }
    }

    /// Locates the node of `prefix`, going through the memoised parent
    /// when only the final token changed.
    fn locate(&mut self, shard: &Shard, prefix: &[Id]) -> usize {
        if prefix.len() > 1 {
            let (head, last) = prefix.split_at(prefix.len() - 1);
            if self.memo_pos == NONE || head != self.memo_key {
                let (matched, pos) = shard.traverse(head);
                if matched != head.len() {
                    return NONE;
                }
                self.memo_key.clear();
                self.memo_key.extend_from_slice(head);
                self.memo_pos = pos;
            }
            shard.find(self.memo_pos, last[0])
        } else {
            let (matched, pos) = shard.traverse(prefix);
            if matched == prefix.len() {
                pos
            } else {
                NONE
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Registers the children of `prefix`, sorting them by id. The prefix
    /// must already be indexed.
    pub fn append(
        &mut self,
        shard: &Shard,
        prefix: &[Id],
        words: &mut Vec<(Id, V)>,
    ) -> Result<()> {
        let pos = self.locate(shard, prefix);
        if pos == NONE {
            return Err(Error::CorruptIndex(format!(
                "no prefix node for ids {:?}",
                prefix
            ))
            .into());
        }
        let rel = pos - self.base;
        debug_assert_eq!(self.runs[rel], (0, 0), "prefix indexed twice");
        self.runs[rel] = (self.ids.len(), self.ids.len() + words.len());
        words.sort_unstable_by_key(|&(id, _)| id);
        for &(id, value) in words.iter() {
            self.ids.push(id);
            self.values.push(value);
        }
        words.clear();
        Ok(())
    }

    /// Seals the order into the shard and returns the payloads in emitted
    /// node order.
    pub fn finish(self, shard: &mut Shard) -> Vec<V> {
        let mut positions = shard.positions.to_builder();
        let mut out_ids = Vec::with_capacity(self.ids.len());
        let mut out_values = Vec::with_capacity(self.values.len());
        for &(first, last) in &self.runs {
            for i in first..last {
                out_ids.push(self.ids[i]);
                out_values.push(self.values[i]);
                positions.push(true);
            }
            positions.push(false);
        }

        let unigrams = shard.offsets[1];
        let old: Vec<Id> = shard.ids.iter().collect();
        shard.ids = PackedVec::from_values(old.into_iter().chain(out_ids.iter().copied()));
        shard.positions = positions.build();
        let size = shard.size();
        shard.offsets.push(size + out_ids.len());
        debug_assert_eq!(shard.ids.len(), shard.size() - unigrams);
        out_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a 3-gram shard over ids 0..4 and checks the trie formulas.
    #[test]
    fn test_trie_construction() -> Result<()> {
        let mut shard = Shard::unigram(4);

        // Bigrams: children of 1 are {0, 2}, children of 3 are {2}.
        let mut indexer = ShardIndexer::new(&shard);
        indexer.append(&shard, &[1], &mut vec![(2u32, 10u64), (0, 5)])?;
        indexer.append(&shard, &[3], &mut vec![(2, 7)])?;
        let counts = indexer.finish(&mut shard);
        assert_eq!(shard.offsets, vec![0, 4, 7]);
        // Children sorted by id within each prefix.
        assert_eq!(counts, vec![5, 10, 7]);
        assert_eq!(shard.index(4), 0);
        assert_eq!(shard.index(5), 2);
        assert_eq!(shard.index(6), 2);

        assert_eq!(shard.children_first(1), 4);
        assert_eq!(shard.children_last(1), 6);
        assert_eq!(shard.children_first(3), 6);
        assert_eq!(shard.children_last(3), 7);
        assert_eq!(shard.children_first(0), 4);
        assert_eq!(shard.children_last(0), 4);
        assert_eq!(shard.parent(4), 1);
        assert_eq!(shard.parent(5), 1);
        assert_eq!(shard.parent(6), 3);

        assert_eq!(shard.find(1, 2), 5);
        assert_eq!(shard.find(1, 3), NONE);
        assert_eq!(shard.find(NONE, 3), 3);
        assert_eq!(shard.traverse(&[1, 2]), (2, 5));
        assert_eq!(shard.traverse(&[1, 3]), (1, 1));

        // Trigrams: children of [1, 2] are {1, 3}.
        let mut indexer = ShardIndexer::new(&shard);
        indexer.append(&shard, &[1, 2], &mut vec![(3u32, 1u64), (1, 2)])?;
        let counts = indexer.finish(&mut shard);
        assert_eq!(counts, vec![2, 1]);
        assert_eq!(shard.offsets, vec![0, 4, 7, 9]);
        assert_eq!(shard.traverse(&[1, 2, 3]), (3, 8));
        assert_eq!(shard.parent(8), 5);
        assert_eq!(shard.node_order(8), 3);
        assert_eq!(shard.node_order(5), 2);
        assert_eq!(shard.node_order(2), 1);

        // Parent/child consistency for every non-unigram node.
        for pos in 4..shard.size() {
            let parent = shard.parent(pos);
            assert!(parent < pos);
            assert!(shard.children_first(parent) <= pos);
            assert!(pos < shard.children_last(parent));
        }
        Ok(())
    }

    #[test]
    fn test_missing_prefix_is_corrupt() {
        let mut shard = Shard::unigram(4);
        let mut indexer = ShardIndexer::new(&shard);
        indexer
            .append(&shard, &[1], &mut vec![(2u32, 1u64)])
            .unwrap();
        indexer.finish(&mut shard);

        let mut indexer = ShardIndexer::<u64>::new(&shard);
        let err = indexer
            .append(&shard, &[2, 2], &mut vec![(1, 1)])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::Error>(),
            Some(crate::error::Error::CorruptIndex(_))
        ));
    }

    /// Path reconstruction returns root-adjacent token first.
    #[test]
    fn test_path_ids() -> Result<()> {
        let mut shard = Shard::unigram(5);
        let mut indexer = ShardIndexer::new(&shard);
        indexer.append(&shard, &[2], &mut vec![(4u32, 1u64)])?;
        indexer.finish(&mut shard);
        let mut indexer = ShardIndexer::new(&shard);
        indexer.append(&shard, &[2, 4], &mut vec![(1u32, 1u64)])?;
        indexer.finish(&mut shard);

        let (matched, pos) = shard.traverse(&[2, 4, 1]);
        assert_eq!(matched, 3);
        let mut path = Vec::new();
        shard.path_ids(pos, &mut path);
        assert_eq!(path, vec![2, 4, 1]);
        Ok(())
    }
}
