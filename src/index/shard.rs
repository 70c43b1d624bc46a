/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! One shard of the reverse trie.
//!
//! Positions `0..U` are the unigram nodes and store no ids; higher-order
//! nodes are laid out breadth-first, grouped by order, with their ids in a
//! packed vector. Parent pointers are not stored: the `positions` bit
//! vector has one run of 1s per node (one 1 per child) terminated by a 0,
//! so `select` recovers both the parent of a node and the child range of a
//! node in constant time.

use crate::error::Error;
use crate::properties::PropList;
use crate::storage::{PackedVec, SuccinctBitVec};
use crate::{Id, NONE};
use anyhow::{Context, Result};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct Shard {
    pub ids: PackedVec<Id>,
    pub positions: SuccinctBitVec,
    /// `offsets[k]` is the first position of order `k + 1`; `offsets[0] =
    /// 0` and `offsets[1]` is the unigram count.
    pub offsets: Vec<usize>,
}

impl Shard {
    /// A shard holding only the unigram range `0..unigrams`.
    pub fn unigram(unigrams: usize) -> Self {
        Shard {
            ids: PackedVec::default(),
            positions: SuccinctBitVec::default(),
            offsets: vec![0, unigrams],
        }
    }

    /// The id at a position; positions below the unigram bound map to
    /// themselves.
    #[inline(always)]
    pub fn index(&self, pos: usize) -> Id {
        if pos < self.offsets[1] {
            pos as Id
        } else {
            self.ids.get(pos - self.offsets[1])
        }
    }

    /// Total number of nodes.
    pub fn size(&self) -> usize {
        *self.offsets.last().unwrap()
    }

    /// Number of nodes that can have children, i.e. everything below the
    /// highest order.
    pub fn position_size(&self) -> usize {
        self.offsets[self.offsets.len() - 2]
    }

    /// The highest indexed order.
    pub fn order(&self) -> usize {
        self.offsets.len() - 1
    }

    /// The order of the n-gram ending at `pos`.
    #[inline(always)]
    pub fn node_order(&self, pos: usize) -> usize {
        debug_assert!(pos < self.size());
        self.offsets.partition_point(|&offset| offset <= pos)
    }

    /// The parent position, or [`NONE`] for unigrams.
    #[inline(always)]
    pub fn parent(&self, pos: usize) -> usize {
        let unigrams = self.offsets[1];
        if pos < unigrams {
            return NONE;
        }
        match self.positions.select((pos + 1 - unigrams) as u64, true) {
            Some(selected) => selected + unigrams - pos,
            None => NONE,
        }
    }

    /// First child position; the root ([`NONE`]) owns the unigram range.
    pub fn children_first(&self, pos: usize) -> usize {
        if pos == NONE {
            0
        } else if pos == 0 {
            self.offsets[1]
        } else {
            self.children_last(pos - 1)
        }
    }

    /// One past the last child position.
    pub fn children_last(&self, pos: usize) -> usize {
        if pos == NONE {
            return self.offsets[1];
        }
        if pos >= self.position_size() {
            return self.size();
        }
        match self.positions.select((pos + 1) as u64, false) {
            Some(last) => last + self.offsets[1] - pos,
            None => self.size(),
        }
    }

    /// Binary search for `id` in `[first, last)`; the unigram range
    /// short-circuits to the identity.
    pub fn lower_bound(&self, first: usize, last: usize, id: Id) -> usize {
        let unigrams = self.offsets[1];
        if last <= unigrams {
            return (id as usize).min(last);
        }
        let mut first = first;
        let mut length = last - first;
        if length <= 128 {
            while first != last && self.ids.get(first - unigrams) < id {
                first += 1;
            }
            first
        } else {
            while length > 0 {
                let half = length >> 1;
                let middle = first + half;
                if self.ids.get(middle - unigrams) < id {
                    first = middle + 1;
                    length = length - half - 1;
                } else {
                    length = half;
                }
            }
            first
        }
    }

    /// The child of `pos` labelled `id`, or [`NONE`].
    pub fn find(&self, pos: usize, id: Id) -> usize {
        let first = self.children_first(pos);
        let last = self.children_last(pos);
        let child = self.lower_bound(first, last, id);
        if child != last && self.index(child) == id {
            child
        } else {
            NONE
        }
    }

    /// Walks from the root following `key`. Returns the number of matched
    /// tokens and the deepest matched position ([`NONE`] if none).
    pub fn traverse(&self, key: &[Id]) -> (usize, usize) {
        let mut pos = NONE;
        for (matched, &id) in key.iter().enumerate() {
            let node = self.find(pos, id);
            if node == NONE {
                return (matched, pos);
            }
            pos = node;
        }
        (key.len(), pos)
    }

    /// Collects the token ids along the root path of `pos`, root-adjacent
    /// token first.
    pub fn path_ids(&self, pos: usize, out: &mut Vec<Id>) {
        out.clear();
        let mut pos = pos;
        while pos != NONE {
            out.push(self.index(pos));
            pos = self.parent(pos);
        }
        out.reverse();
    }

    /// Logical size of the trie data as plain arrays.
    pub fn size_bytes(&self) -> usize {
        self.ids.size_bytes() + self.positions.size_bytes()
    }

    /// Size of the packed on-disk images.
    pub fn size_compressed(&self) -> usize {
        self.ids.size_compressed() + self.positions.size_compressed()
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let props = PropList::load(dir)?;
        let order: usize = props.require("order")?;
        let mut offsets = vec![0];
        for n in 1..=order {
            offsets.push(props.require(&format!("{}-gram-offset", n))?);
        }
        if offsets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::CorruptIndex(format!(
                "non-monotonic offsets in {}",
                dir.display()
            ))
            .into());
        }
        let ids = PackedVec::open(dir.join("index"))
            .with_context(|| format!("Cannot open ids of {}", dir.display()))?;
        let positions = SuccinctBitVec::open(dir.join("position"))
            .with_context(|| format!("Cannot open positions of {}", dir.display()))?;
        if ids.len() != offsets[order] - offsets[1] {
            return Err(Error::CorruptIndex(format!(
                "{}: {} ids for offsets ending at {}",
                dir.display(),
                ids.len(),
                offsets[order]
            ))
            .into());
        }
        Ok(Shard {
            ids,
            positions,
            offsets,
        })
    }

    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;
        self.ids.write(dir.join("index"))?;
        self.positions.write(dir.join("position"))?;
        let mut props = PropList::new();
        props.set("order", self.order());
        for n in 1..=self.order() {
            props.set(&format!("{}-gram-offset", n), self.offsets[n]);
        }
        props.store(dir)
    }
}
