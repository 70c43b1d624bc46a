/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! A select-capable bitmap backing the trie's position vector.
//!
//! The on-disk image is `len` followed by the LSB-first 64-bit words, all
//! little-endian, so it is bit-identical across platforms. The two-level
//! select directory (cumulative counts per 512-bit superblock, then a word
//! scan with an in-word broadword select) is rebuilt when the image is
//! opened and never stored.

use crate::error::Error;
use crate::storage::MmapBackend;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Words per superblock; 8 words = 512 bits.
const SB_WORDS: usize = 8;
const SB_BITS: usize = SB_WORDS * 64;

enum Words {
    Mem(Arc<Vec<u64>>),
    Map(MmapBackend<u64>),
}

impl Words {
    fn as_slice(&self) -> &[u64] {
        match self {
            Words::Mem(words) => words,
            // The first word of the image is the length.
            Words::Map(mmap) => &mmap.as_ref()[1..],
        }
    }
}

impl Clone for Words {
    fn clone(&self) -> Self {
        match self {
            Words::Mem(words) => Words::Mem(words.clone()),
            Words::Map(mmap) => Words::Map(mmap.clone()),
        }
    }
}

/// Position of the `rank`-th (1-counted) set bit of `word`, which must
/// exist.
#[inline(always)]
fn select_in_word(mut word: u64, mut rank: u64) -> u32 {
    debug_assert!(rank >= 1 && word.count_ones() as u64 >= rank);
    loop {
        let bit = word.trailing_zeros();
        if rank == 1 {
            return bit;
        }
        word &= word - 1;
        rank -= 1;
    }
}

/// An immutable bit vector with constant-time `select` over both bit
/// values.
pub struct SuccinctBitVec {
    words: Words,
    len: usize,
    /// Ones before each superblock, one extra entry with the total.
    sb_ones: Vec<u64>,
}

impl Clone for SuccinctBitVec {
    fn clone(&self) -> Self {
        SuccinctBitVec {
            words: self.words.clone(),
            len: self.len,
            sb_ones: self.sb_ones.clone(),
        }
    }
}

impl std::fmt::Debug for SuccinctBitVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuccinctBitVec")
            .field("len", &self.len)
            .field("ones", &self.count_ones())
            .finish()
    }
}

impl Default for SuccinctBitVec {
    fn default() -> Self {
        BitVecBuilder::new().build()
    }
}

impl SuccinctBitVec {
    fn with_directory(words: Words, len: usize) -> Self {
        let slice = words.as_slice();
        let mut sb_ones = Vec::with_capacity(slice.len() / SB_WORDS + 2);
        let mut ones = 0u64;
        sb_ones.push(0);
        for (i, word) in slice.iter().enumerate() {
            ones += word.count_ones() as u64;
            if (i + 1) % SB_WORDS == 0 {
                sb_ones.push(ones);
            }
        }
        if slice.len() % SB_WORDS != 0 || slice.is_empty() {
            sb_ones.push(ones);
        }
        SuccinctBitVec {
            words,
            len,
            sb_ones,
        }
    }

    /// Memory-maps a written bit vector.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mmap = MmapBackend::<u64>::load(path)?;
        if mmap.is_empty() {
            return Err(
                Error::CorruptIndex(format!("truncated bit vector {}", path.display())).into(),
            );
        }
        let len = mmap.as_ref()[0] as usize;
        if mmap.len() - 1 != len.div_ceil(64) {
            return Err(Error::CorruptIndex(format!(
                "bit vector {} has {} words for {} bits",
                path.display(),
                mmap.len() - 1,
                len
            ))
            .into());
        }
        Ok(Self::with_directory(Words::Map(mmap), len))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .map_err(|e| Error::io(path, e))
            .with_context(|| format!("Cannot create {}", path.display()))?;
        let mut out = std::io::BufWriter::new(file);
        out.write_all(&(self.len as u64).to_le_bytes())?;
        for word in self.words.as_slice() {
            out.write_all(&word.to_le_bytes())?;
        }
        out.into_inner()
            .map_err(|e| anyhow::anyhow!("Cannot flush {}: {}", path.display(), e))?
            .sync_all()
            .map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_ones(&self) -> u64 {
        *self.sb_ones.last().unwrap()
    }

    pub fn count_zeros(&self) -> u64 {
        self.len as u64 - self.count_ones()
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let words = self.words.as_slice();
        words[index >> 6] >> (index & 63) & 1 != 0
    }

    /// Number of valid bits of word `w`, masking the padding of the last
    /// word.
    #[inline(always)]
    fn valid_bits(&self, word: usize) -> u32 {
        (self.len - word * 64).min(64) as u32
    }

    #[inline(always)]
    fn masked_word(&self, word: usize) -> u64 {
        let value = self.words.as_slice()[word];
        let valid = self.valid_bits(word);
        if valid == 64 {
            value
        } else {
            value & ((1u64 << valid) - 1)
        }
    }

    /// Position of the `rank`-th (1-counted) occurrence of `bit`, or `None`
    /// if there are fewer.
    pub fn select(&self, rank: u64, bit: bool) -> Option<usize> {
        debug_assert!(rank >= 1);
        if bit {
            self.select_one(rank)
        } else {
            self.select_zero(rank)
        }
    }

    fn select_one(&self, rank: u64) -> Option<usize> {
        if rank > self.count_ones() {
            return None;
        }
        // The last superblock with fewer than `rank` ones before it.
        let sb = self.sb_ones.partition_point(|&ones| ones < rank) - 1;
        let mut remaining = rank - self.sb_ones[sb];
        let first_word = sb * SB_WORDS;
        let last_word = self.words.as_slice().len().min(first_word + SB_WORDS);
        for word in first_word..last_word {
            let value = self.masked_word(word);
            let ones = value.count_ones() as u64;
            if remaining <= ones {
                return Some(word * 64 + select_in_word(value, remaining) as usize);
            }
            remaining -= ones;
        }
        unreachable!("select directory out of sync");
    }

    fn select_zero(&self, rank: u64) -> Option<usize> {
        if rank > self.count_zeros() {
            return None;
        }
        // Zeros before superblock i: valid bits before it minus ones.
        let zeros_before = |i: usize| {
            let bits = (i * SB_BITS).min(self.len) as u64;
            bits - self.sb_ones[i]
        };
        let mut lo = 0;
        let mut hi = self.sb_ones.len() - 1;
        // Last superblock with zeros_before < rank.
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if zeros_before(mid) < rank {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let mut remaining = rank - zeros_before(lo);
        let first_word = lo * SB_WORDS;
        let last_word = self.words.as_slice().len().min(first_word + SB_WORDS);
        for word in first_word..last_word {
            let valid = self.valid_bits(word);
            let inverted = !self.words.as_slice()[word]
                & if valid == 64 {
                    u64::MAX
                } else {
                    (1u64 << valid) - 1
                };
            let zeros = inverted.count_ones() as u64;
            if remaining <= zeros {
                return Some(word * 64 + select_in_word(inverted, remaining) as usize);
            }
            remaining -= zeros;
        }
        unreachable!("select-zero directory out of sync");
    }

    /// The size of a plain bitmap holding the same bits.
    pub fn size_bytes(&self) -> usize {
        self.len.div_ceil(8)
    }

    /// The on-disk image size.
    pub fn size_compressed(&self) -> usize {
        (self.words.as_slice().len() + 1) * 8
    }

    /// Copies the words out for further appending.
    pub fn to_builder(&self) -> BitVecBuilder {
        BitVecBuilder {
            words: self.words.as_slice().to_vec(),
            len: self.len,
        }
    }
}

/// An appendable bit vector, sealed into a [`SuccinctBitVec`].
#[derive(Debug, Clone, Default)]
pub struct BitVecBuilder {
    words: Vec<u64>,
    len: usize,
}

impl BitVecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, bit: bool) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        if bit {
            self.words[self.len >> 6] |= 1 << (self.len & 63);
        }
        self.len += 1;
    }

    pub fn set(&mut self, index: usize, bit: bool) {
        while self.len <= index {
            self.push(false);
        }
        let mask = 1u64 << (index & 63);
        if bit {
            self.words[index >> 6] |= mask;
        } else {
            self.words[index >> 6] &= !mask;
        }
    }

    pub fn build(self) -> SuccinctBitVec {
        SuccinctBitVec::with_directory(Words::Mem(Arc::new(self.words)), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn reference_select(bits: &[bool], rank: u64, bit: bool) -> Option<usize> {
        let mut seen = 0;
        for (i, &b) in bits.iter().enumerate() {
            if b == bit {
                seen += 1;
                if seen == rank {
                    return Some(i);
                }
            }
        }
        None
    }

    #[test]
    fn test_select_exhaustive_small() {
        let bits: Vec<bool> = [1u8, 1, 0, 1, 0, 0, 1, 0, 1, 1, 0]
            .iter()
            .map(|&b| b != 0)
            .collect();
        let mut builder = BitVecBuilder::new();
        bits.iter().for_each(|&b| builder.push(b));
        let vec = builder.build();
        assert_eq!(vec.len(), bits.len());
        for bit in [false, true] {
            for rank in 1..=bits.len() as u64 {
                assert_eq!(
                    vec.select(rank, bit),
                    reference_select(&bits, rank, bit),
                    "rank {} bit {}",
                    rank,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_select_random_long() {
        let mut rng = SmallRng::seed_from_u64(42);
        let bits: Vec<bool> = (0..10_000).map(|_| rng.random_bool(0.3)).collect();
        let mut builder = BitVecBuilder::new();
        bits.iter().for_each(|&b| builder.push(b));
        let vec = builder.build();

        let ones = bits.iter().filter(|&&b| b).count() as u64;
        assert_eq!(vec.count_ones(), ones);
        for rank in (1..=ones).step_by(61) {
            assert_eq!(vec.select(rank, true), reference_select(&bits, rank, true));
        }
        let zeros = bits.len() as u64 - ones;
        for rank in (1..=zeros).step_by(67) {
            assert_eq!(vec.select(rank, false), reference_select(&bits, rank, false));
        }
        assert_eq!(vec.select(ones + 1, true), None);
        assert_eq!(vec.select(zeros + 1, false), None);
    }

    #[test]
    fn test_round_trip_on_disk() -> Result<()> {
        let mut builder = BitVecBuilder::new();
        for i in 0..1000 {
            builder.push(i % 7 == 0);
        }
        let vec = builder.build();

        let dir = tempfile::Builder::new().prefix("bitvec-").tempdir()?;
        let path = dir.path().join("position");
        vec.write(&path)?;

        let mapped = SuccinctBitVec::open(&path)?;
        assert_eq!(mapped.len(), 1000);
        for rank in 1..=mapped.count_ones() {
            assert_eq!(mapped.select(rank, true), vec.select(rank, true));
        }

        let copy = dir.path().join("copy");
        mapped.write(&copy)?;
        assert_eq!(std::fs::read(&path)?, std::fs::read(&copy)?);
        Ok(())
    }

    #[test]
    fn test_set_and_get() {
        let mut builder = BitVecBuilder::new();
        builder.set(70, true);
        builder.set(3, true);
        builder.set(70, false);
        builder.set(65, true);
        let vec = builder.build();
        assert_eq!(vec.len(), 71);
        assert!(vec.get(3));
        assert!(vec.get(65));
        assert!(!vec.get(70));
        assert_eq!(vec.count_ones(), 2);
        assert_eq!(vec.select(2, true), Some(65));
    }

    #[test]
    fn test_trailing_padding_not_counted_as_zeros() {
        let mut builder = BitVecBuilder::new();
        for _ in 0..3 {
            builder.push(true);
        }
        let vec = builder.build();
        assert_eq!(vec.count_zeros(), 0);
        assert_eq!(vec.select(1, false), None);
    }
}
