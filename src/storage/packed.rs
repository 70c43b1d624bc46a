/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Variable-bit-width packed integer vectors.
//!
//! Values are grouped in frames of 64 elements; each frame is packed with
//! the number of bits needed by its largest value, and a frame directory of
//! `(bit offset, width)` words allows O(1) random access while skipping
//! long runs of small values.
//!
//! On disk the vector is a single little-endian file: `len`, `num_frames`,
//! the directory words, then the data words, each 64-bit. Bits are packed
//! LSB-first.

use crate::error::Error;
use crate::storage::MmapBackend;
use anyhow::{Context, Result};
use std::io::Write;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

/// Elements per frame.
const FRAME: usize = 64;
/// Low 56 bits of a directory word hold the bit offset, the high 8 the
/// width.
const OFFSET_MASK: u64 = (1 << 56) - 1;

/// Integer-like values storable in a [`PackedVec`].
pub trait Packable: Copy + 'static {
    fn to_word(self) -> u64;
    fn from_word(word: u64) -> Self;
}

macro_rules! impl_packable {
    ($($ty:ty),*) => {$(
        impl Packable for $ty {
            fn to_word(self) -> u64 {
                self as u64
            }
            fn from_word(word: u64) -> Self {
                word as $ty
            }
        }
    )*};
}

impl_packable!(u8, u16, u32, u64, usize);

enum Words {
    Mem(Arc<Vec<u64>>),
    Map(MmapBackend<u64>),
}

impl Words {
    fn as_slice(&self) -> &[u64] {
        match self {
            Words::Mem(words) => words,
            Words::Map(mmap) => mmap.as_ref(),
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

/// A sealed packed vector; build one with [`PackedVecBuilder`] or open a
/// written one with [`PackedVec::open`].
pub struct PackedVec<T: Packable> {
    words: Words,
    len: usize,
    num_frames: usize,
    _marker: PhantomData<T>,
}

impl<T: Packable> Clone for PackedVec<T> {
    fn clone(&self) -> Self {
        PackedVec {
            words: self.words.clone(),
            len: self.len,
            num_frames: self.num_frames,
            _marker: PhantomData,
        }
    }
}

impl<T: Packable> std::fmt::Debug for PackedVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedVec").field("len", &self.len).finish()
    }
}

impl<T: Packable> Default for PackedVec<T> {
    fn default() -> Self {
        PackedVecBuilder::new().build()
    }
}

impl<T: Packable> PackedVec<T> {
    pub fn from_values(values: impl IntoIterator<Item = T>) -> Self {
        let mut builder = PackedVecBuilder::new();
        for value in values {
            builder.push(value);
        }
        builder.build()
    }

    /// Memory-maps a written vector.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mmap = MmapBackend::<u64>::load(path)?;
        let words = mmap.as_ref();
        if words.len() < 2 {
            return Err(
                Error::CorruptIndex(format!("truncated packed vector {}", path.display())).into(),
            );
        }
        let len = words[0] as usize;
        let num_frames = words[1] as usize;
        if num_frames != len.div_ceil(FRAME) || words.len() < 2 + num_frames {
            return Err(
                Error::CorruptIndex(format!("malformed packed vector {}", path.display())).into(),
            );
        }
        Ok(PackedVec {
            words: Words::Map(mmap),
            len,
            num_frames,
            _marker: PhantomData,
        })
    }

    /// Writes the vector; the image is identical whether the vector was
    /// freshly built or itself mapped from disk.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .map_err(|e| Error::io(path, e))
            .with_context(|| format!("Cannot create {}", path.display()))?;
        let mut out = std::io::BufWriter::new(file);
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

    #[inline(always)]
    pub fn get(&self, index: usize) -> T {
        debug_assert!(index < self.len);
        let words = self.words.as_slice();
        let entry = words[2 + (index >> 6)];
        let width = (entry >> 56) as u32;
        if width == 0 {
            return T::from_word(0);
        }
        let bit = (entry & OFFSET_MASK) + ((index & (FRAME - 1)) as u64) * width as u64;
        let data = &words[2 + self.num_frames..];
        let word = (bit >> 6) as usize;
        let shift = (bit & 63) as u32;
        let mut value = data[word] >> shift;
        if shift + width > 64 {
            value |= data[word + 1] << (64 - shift);
        }
        if width < 64 {
            value &= (1u64 << width) - 1;
        }
        T::from_word(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    /// The size the values would take stored as plain `u64`.
    pub fn size_bytes(&self) -> usize {
        self.len * 8
    }

    /// The size of the packed image.
    pub fn size_compressed(&self) -> usize {
        self.words.as_slice().len() * 8
    }
}

/// Accumulates values, then seals them into a [`PackedVec`].
#[derive(Debug, Clone, Default)]
pub struct PackedVecBuilder<T: Packable> {
    raw: Vec<u64>,
    _marker: PhantomData<T>,
}

impl<T: Packable> PackedVecBuilder<T> {
    pub fn new() -> Self {
        PackedVecBuilder {
            raw: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn push(&mut self, value: T) {
        self.raw.push(value.to_word());
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Seals the width of every frame and packs the bits.
    pub fn build(self) -> PackedVec<T> {
        let len = self.raw.len();
        let num_frames = len.div_ceil(FRAME);
        let mut words = vec![0u64; 2 + num_frames];
        words[0] = len as u64;
        words[1] = num_frames as u64;

        let mut bit = 0u64;
        for (frame, chunk) in self.raw.chunks(FRAME).enumerate() {
            let max = chunk.iter().copied().max().unwrap_or(0);
            let width = (64 - max.leading_zeros()) as u64;
            words[2 + frame] = bit | (width << 56);
            bit += width * chunk.len() as u64;
        }

        let data_words = (bit as usize).div_ceil(64);
        let data_start = words.len();
        words.resize(data_start + data_words, 0);

        let mut bit = 0u64;
        for chunk in self.raw.chunks(FRAME) {
            let max = chunk.iter().copied().max().unwrap_or(0);
            let width = (64 - max.leading_zeros()) as u64;
            if width == 0 {
                continue;
            }
            for &value in chunk {
                let word = data_start + (bit >> 6) as usize;
                let shift = (bit & 63) as u32;
                words[word] |= value << shift;
                if shift as u64 + width > 64 {
                    words[word + 1] |= value >> (64 - shift);
                }
                bit += width;
            }
        }

        PackedVec {
            words: Words::Mem(Arc::new(words)),
            len,
            num_frames,
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_build_and_get() {
        let values: Vec<u64> = vec![0, 1, 2, 3, 1 << 40, 7, 0, u64::MAX];
        let packed = PackedVec::from_values(values.iter().copied());
        assert_eq!(packed.len(), values.len());
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(packed.get(i), v);
        }
    }

    #[test]
    fn test_small_values_pack_tightly() {
        let packed = PackedVec::from_values((0..10_000u64).map(|i| i % 4));
        assert!(packed.size_compressed() < packed.size_bytes() / 8);
    }

    #[test]
    fn test_round_trip_on_disk() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let values: Vec<u32> = (0..5_000)
            .map(|_| {
                let bits = rng.random_range(1..32);
                rng.random_range(0..1 << bits)
            })
            .collect();
        let packed = PackedVec::from_values(values.iter().copied());

        let dir = tempfile::Builder::new().prefix("packed-").tempdir()?;
        let path = dir.path().join("index");
        packed.write(&path)?;

        let mapped = PackedVec::<u32>::open(&path)?;
        assert_eq!(mapped.len(), values.len());
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(mapped.get(i), v);
        }

        // Writing the mapped image again must be byte-identical.
        let copy = dir.path().join("copy");
        mapped.write(&copy)?;
        assert_eq!(std::fs::read(&path)?, std::fs::read(&copy)?);
        Ok(())
    }

    #[test]
    fn test_empty() -> Result<()> {
        let packed = PackedVec::<u64>::from_values([]);
        assert!(packed.is_empty());
        let dir = tempfile::Builder::new().prefix("packed-e-").tempdir()?;
        let path = dir.path().join("index");
        packed.write(&path)?;
        let mapped = PackedVec::<u64>::open(&path)?;
        assert!(mapped.is_empty());
        Ok(())
    }
}
