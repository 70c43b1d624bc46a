/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Random-access typed arrays, raw or block-compressed.
//!
//! A [`BlockFile`] is either a single memory-mapped file of little-endian
//! values, or a directory of 8 KiB payload blocks compressed with a
//! [`BlockCodec`](crate::codec::BlockCodec) plus an `index` of compressed
//! end offsets, a `type` tag and a `size` element count.
//!
//! Reads of compressed storage go through a two-level cache: a direct-mapped
//! cache with a try-lock publish policy (readers never block; a racing miss
//! just recomputes the block, which is a pure function of its id), then a
//! per-slot [`ArcCache`] of decompressed blocks. Slots are owned by the
//! handle and acquired per read, so there are no thread-local pointers and
//! no ownership cycles.

use crate::codec::{codec_for, BlockCodec};
use crate::error::Error;
use crate::storage::{ArcCache, MmapBackend};
use anyhow::{Context, Result};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const BLOCK_BITS: u32 = 13;
pub const BLOCK_SIZE: usize = 1 << BLOCK_BITS;
pub const BLOCK_MASK: usize = BLOCK_SIZE - 1;

/// Entries per ARC slot cache.
const ARC_ENTRIES: usize = 16;

/// A value with a fixed little-endian encoding.
pub trait FixedWidth: Copy + 'static {
    const BYTES: usize;
    fn write_le(self, dst: &mut [u8]);
    fn read_le(src: &[u8]) -> Self;
}

macro_rules! impl_fixed_width {
    ($($ty:ty),*) => {$(
        impl FixedWidth for $ty {
            const BYTES: usize = core::mem::size_of::<$ty>();
            fn write_le(self, dst: &mut [u8]) {
                dst[..Self::BYTES].copy_from_slice(&self.to_le_bytes());
            }
            fn read_le(src: &[u8]) -> Self {
                <$ty>::from_le_bytes(src[..Self::BYTES].try_into().unwrap())
            }
        }
    )*};
}

impl_fixed_width!(u8, u16, u32, u64, f32, f64);

/// The lock-free front cache: direct-mapped, try-lock on both sides.
struct DirectCache {
    slots: Box<[Mutex<Option<(u64, Arc<[u8]>)>>]>,
    mask: u64,
}

impl DirectCache {
    fn new(num_blocks: usize) -> Self {
        let size = (num_blocks / 32).next_power_of_two().max(16);
        DirectCache {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            mask: size as u64 - 1,
        }
    }

    fn get(&self, id: u64) -> Option<Arc<[u8]>> {
        let guard = self.slots[(id & self.mask) as usize].try_lock().ok()?;
        match &*guard {
            Some((key, block)) if *key == id => Some(block.clone()),
            _ => None,
        }
    }

    fn publish(&self, id: u64, block: Arc<[u8]>) {
        if let Ok(mut guard) = self.slots[(id & self.mask) as usize].try_lock() {
            *guard = Some((id, block));
        }
    }
}

/// One decompression context: a codec with its scratch plus an ARC cache.
struct Slot {
    codec: Box<dyn BlockCodec>,
    cache: ArcCache,
    scratch: Vec<u8>,
}

/// Thread-indexed slot table. A reader acquires whichever slot is free and
/// returns it when the read completes; under contention the first slot is
/// waited on.
struct SlotTable {
    slots: Box<[Mutex<Slot>]>,
}

impl SlotTable {
    fn new(codec: &dyn BlockCodec) -> Self {
        let n = (num_cpus::get() * 2).clamp(4, 64);
        SlotTable {
            slots: (0..n)
                .map(|_| {
                    Mutex::new(Slot {
                        codec: codec.boxed_clone(),
                        cache: ArcCache::new(ARC_ENTRIES),
                        scratch: Vec::with_capacity(BLOCK_SIZE),
                    })
                })
                .collect(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> R {
        for slot in self.slots.iter() {
            if let Ok(mut guard) = slot.try_lock() {
                return f(&mut guard);
            }
        }
        f(&mut self.slots[0].lock().unwrap())
    }
}

enum ByteStore {
    Raw {
        mmap: MmapBackend<u8>,
    },
    Blocks {
        data: MmapBackend<u8>,
        ends: Box<[u64]>,
        len_bytes: usize,
        direct: DirectCache,
        slots: SlotTable,
        path: PathBuf,
    },
}

impl ByteStore {
    fn fetch(
        data: &MmapBackend<u8>,
        ends: &[u64],
        len_bytes: usize,
        direct: &DirectCache,
        slots: &SlotTable,
        path: &Path,
        id: u64,
    ) -> Result<Arc<[u8]>> {
        if let Some(block) = direct.get(id) {
            return Ok(block);
        }
        slots.with(|slot| {
            if let Some(block) = slot.cache.get(id) {
                return Ok(block);
            }
            let start = if id == 0 { 0 } else { ends[id as usize - 1] } as usize;
            let end = ends[id as usize] as usize;
            let src = &data.as_ref()[start..end];
            let mut scratch = std::mem::take(&mut slot.scratch);
            slot.codec.decompress(src, &mut scratch)?;
            let expected = BLOCK_SIZE.min(len_bytes - (id as usize) * BLOCK_SIZE);
            if scratch.len() != expected {
                return Err(Error::CorruptBlock(format!(
                    "block {} of {} decompressed to {} bytes, expected {}",
                    id,
                    path.display(),
                    scratch.len(),
                    expected
                ))
                .into());
            }
            let block: Arc<[u8]> = Arc::from(scratch.as_slice());
            slot.scratch = scratch;
            slot.cache.insert(id, block.clone());
            direct.publish(id, block.clone());
            Ok(block)
        })
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        match self {
            ByteStore::Raw { mmap } => {
                let bytes = mmap.as_ref();
                let end = offset + dst.len();
                if end > bytes.len() {
                    return Err(Error::CorruptIndex(format!(
                        "read of {}..{} beyond raw storage of {} bytes",
                        offset,
                        end,
                        bytes.len()
                    ))
                    .into());
                }
                dst.copy_from_slice(&bytes[offset..end]);
                Ok(())
            }
            ByteStore::Blocks {
                data,
                ends,
                len_bytes,
                direct,
                slots,
                path,
            } => {
                if offset + dst.len() > *len_bytes {
                    return Err(Error::CorruptIndex(format!(
                        "read of {}..{} beyond block storage of {} bytes",
                        offset,
                        offset + dst.len(),
                        len_bytes
                    ))
                    .into());
                }
                let mut offset = offset;
                let mut dst = dst;
                while !dst.is_empty() {
                    let id = (offset >> BLOCK_BITS) as u64;
                    let start = offset & BLOCK_MASK;
                    let n = (BLOCK_SIZE - start).min(dst.len());
                    let block =
                        Self::fetch(data, ends, *len_bytes, direct, slots, path, id)?;
                    let (head, tail) = std::mem::take(&mut dst).split_at_mut(n);
                    head.copy_from_slice(&block[start..start + n]);
                    dst = tail;
                    offset += n;
                }
                Ok(())
            }
        }
    }

    fn len_bytes(&self) -> usize {
        match self {
            ByteStore::Raw { mmap } => mmap.len(),
            ByteStore::Blocks { len_bytes, .. } => *len_bytes,
        }
    }

    fn size_compressed(&self) -> usize {
        match self {
            ByteStore::Raw { mmap } => mmap.len(),
            ByteStore::Blocks { data, ends, .. } => data.len() + ends.len() * 8,
        }
    }
}

/// A random-access array of fixed-width values, raw or block-compressed.
pub struct BlockFile<T: FixedWidth> {
    store: Arc<ByteStore>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: FixedWidth> Clone for BlockFile<T> {
    fn clone(&self) -> Self {
        BlockFile {
            store: self.store.clone(),
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T: FixedWidth> std::fmt::Debug for BlockFile<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile").field("len", &self.len).finish()
    }
}

impl<T: FixedWidth> BlockFile<T> {
    /// Opens `path`: a plain file is the raw representation, a directory the
    /// block-compressed one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            Self::open_blocks(path)
        } else {
            let mmap = MmapBackend::<u8>::load(path)?;
            if mmap.len() % T::BYTES != 0 {
                return Err(Error::CorruptIndex(format!(
                    "{}: {} bytes is not a multiple of the element width {}",
                    path.display(),
                    mmap.len(),
                    T::BYTES
                ))
                .into());
            }
            let len = mmap.len() / T::BYTES;
            Ok(BlockFile {
                store: Arc::new(ByteStore::Raw { mmap }),
                len,
                _marker: PhantomData,
            })
        }
    }

    fn open_blocks(dir: &Path) -> Result<Self> {
        let type_path = dir.join("type");
        let tag = std::fs::read_to_string(&type_path)
            .map_err(|e| Error::io(&type_path, e))
            .with_context(|| format!("Cannot read {}", type_path.display()))?;
        let codec = codec_for(tag.trim())?;

        let size_path = dir.join("size");
        let size = std::fs::read_to_string(&size_path)
            .map_err(|e| Error::io(&size_path, e))
            .with_context(|| format!("Cannot read {}", size_path.display()))?;
        let len: usize = size.trim().parse().map_err(|_| {
            Error::CorruptIndex(format!("malformed size file {}", size_path.display()))
        })?;
        let len_bytes = len * T::BYTES;

        let index_path = dir.join("index");
        let index_bytes = std::fs::read(&index_path)
            .map_err(|e| Error::io(&index_path, e))
            .with_context(|| format!("Cannot read {}", index_path.display()))?;
        if index_bytes.len() % 8 != 0 {
            return Err(
                Error::CorruptIndex(format!("ragged index file {}", index_path.display())).into(),
            );
        }
        let ends: Box<[u64]> = index_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let num_blocks = len_bytes.div_ceil(BLOCK_SIZE);
        if ends.len() != num_blocks || ends.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::CorruptIndex(format!(
                "index of {} has {} entries for {} blocks",
                dir.display(),
                ends.len(),
                num_blocks
            ))
            .into());
        }

        let data = MmapBackend::<u8>::load(dir.join("data"))?;
        if ends.last().copied().unwrap_or(0) != data.len() as u64 {
            return Err(Error::CorruptIndex(format!(
                "data of {} is {} bytes but the index ends at {}",
                dir.display(),
                data.len(),
                ends.last().copied().unwrap_or(0)
            ))
            .into());
        }

        Ok(BlockFile {
            store: Arc::new(ByteStore::Blocks {
                data,
                direct: DirectCache::new(ends.len()),
                slots: SlotTable::new(codec.as_ref()),
                ends,
                len_bytes,
                path: dir.to_owned(),
            }),
            len,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies a contiguous byte range into `dst`.
    pub fn read(&self, byte_offset: usize, dst: &mut [u8]) -> Result<()> {
        self.store.read(byte_offset, dst)
    }

    pub fn get(&self, index: usize) -> Result<T> {
        let mut buf = [0u8; 8];
        self.store.read(index * T::BYTES, &mut buf[..T::BYTES])?;
        Ok(T::read_le(&buf))
    }

    /// A random-access iterator, valid while the file is open. Iterators
    /// compare equal when they wrap the same storage and position.
    pub fn iter(&self) -> BlockFileIter<'_, T> {
        BlockFileIter { file: self, pos: 0 }
    }

    pub fn size_bytes(&self) -> usize {
        self.store.len_bytes()
    }

    pub fn size_compressed(&self) -> usize {
        self.store.size_compressed()
    }
}

pub struct BlockFileIter<'a, T: FixedWidth> {
    file: &'a BlockFile<T>,
    pos: usize,
}

impl<T: FixedWidth> PartialEq for BlockFileIter<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.file.store, &other.file.store) && self.pos == other.pos
    }
}

impl<T: FixedWidth> Eq for BlockFileIter<'_, T> {}

impl<T: FixedWidth> Iterator for BlockFileIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.file.len {
            return None;
        }
        let item = self.file.get(self.pos);
        self.pos += 1;
        Some(item)
    }
}

enum WriterInner {
    Raw {
        out: std::io::BufWriter<std::fs::File>,
    },
    Blocks {
        dir: PathBuf,
        codec: Box<dyn BlockCodec>,
        buf: Vec<u8>,
        comp: Vec<u8>,
        out: std::io::BufWriter<std::fs::File>,
        ends: Vec<u64>,
        written: u64,
    },
}

/// Writes either representation of a [`BlockFile`]; data is fsynced before
/// the writer reports success.
pub struct BlockFileWriter<T: FixedWidth> {
    inner: WriterInner,
    count: usize,
    _marker: PhantomData<T>,
}

impl<T: FixedWidth> BlockFileWriter<T> {
    /// Creates a raw writer targeting a single file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .map_err(|e| Error::io(path, e))
            .with_context(|| format!("Cannot create {}", path.display()))?;
        Ok(BlockFileWriter {
            inner: WriterInner::Raw {
                out: std::io::BufWriter::new(file),
            },
            count: 0,
            _marker: PhantomData,
        })
    }

    /// Creates a block-compressed writer targeting a directory.
    pub fn create_compressed(
        dir: impl AsRef<Path>,
        codec: Box<dyn BlockCodec>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;
        let data_path = dir.join("data");
        let file = std::fs::File::create(&data_path)
            .map_err(|e| Error::io(&data_path, e))
            .with_context(|| format!("Cannot create {}", data_path.display()))?;
        Ok(BlockFileWriter {
            inner: WriterInner::Blocks {
                dir: dir.to_owned(),
                codec,
                buf: Vec::with_capacity(2 * BLOCK_SIZE),
                comp: Vec::new(),
                out: std::io::BufWriter::new(file),
                ends: Vec::new(),
                written: 0,
            },
            count: 0,
            _marker: PhantomData,
        })
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        let mut buf = [0u8; 8];
        value.write_le(&mut buf);
        self.count += 1;
        match &mut self.inner {
            WriterInner::Raw { out } => {
                out.write_all(&buf[..T::BYTES])?;
            }
            WriterInner::Blocks {
                codec,
                buf: pending,
                comp,
                out,
                ends,
                written,
                ..
            } => {
                pending.extend_from_slice(&buf[..T::BYTES]);
                while pending.len() >= BLOCK_SIZE {
                    codec.compress(&pending[..BLOCK_SIZE], comp)?;
                    out.write_all(comp)?;
                    *written += comp.len() as u64;
                    ends.push(*written);
                    pending.drain(..BLOCK_SIZE);
                }
            }
        }
        Ok(())
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = T>) -> Result<()> {
        for value in values {
            self.push(value)?;
        }
        Ok(())
    }

    /// Flushes, writes the metadata files and fsyncs. Returns the element
    /// count.
    pub fn finish(self) -> Result<usize> {
        match self.inner {
            WriterInner::Raw { out } => {
                let file = out
                    .into_inner()
                    .map_err(|e| anyhow::anyhow!("Cannot flush raw storage: {}", e))?;
                file.sync_all()?;
            }
            WriterInner::Blocks {
                dir,
                mut codec,
                buf,
                mut comp,
                mut out,
                mut ends,
                mut written,
            } => {
                if !buf.is_empty() {
                    codec.compress(&buf, &mut comp)?;
                    out.write_all(&comp)?;
                    written += comp.len() as u64;
                    ends.push(written);
                }
                let file = out
                    .into_inner()
                    .map_err(|e| anyhow::anyhow!("Cannot flush block storage: {}", e))?;
                file.sync_all()?;

                let mut index = Vec::with_capacity(ends.len() * 8);
                for end in &ends {
                    index.extend_from_slice(&end.to_le_bytes());
                }
                std::fs::write(dir.join("index"), index)
                    .with_context(|| format!("Cannot write index of {}", dir.display()))?;
                std::fs::write(dir.join("type"), format!("{}-block", codec.name()))
                    .with_context(|| format!("Cannot write type of {}", dir.display()))?;
                std::fs::write(dir.join("size"), format!("{}", self.count))
                    .with_context(|| format!("Cannot write size of {}", dir.display()))?;
            }
        }
        Ok(self.count)
    }
}
