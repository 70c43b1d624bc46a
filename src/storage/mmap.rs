/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{Context, Result};
use core::fmt::Debug;
use mmap_rs::{Mmap, MmapFlags};
use std::path::Path;
use std::sync::Arc;

/// A read-only memory mapping viewed as a `&[W]`.
///
/// The mapping is reference counted, so clones are cheap and the backing
/// region lives as long as any user. Zero-length files are represented
/// without a mapping, as empty mappings are not portable.
#[derive(Clone)]
pub struct MmapBackend<W> {
    mmap: Option<Arc<Mmap>>,
    len: usize,
    _marker: core::marker::PhantomData<W>,
}

impl<W> Debug for MmapBackend<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmapBackend")
            .field("len", &self.len)
            .finish()
    }
}

impl<W> MmapBackend<W> {
    /// Memory-maps a whole file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_len = path
            .metadata()
            .map_err(|e| crate::error::Error::io(path, e))
            .with_context(|| format!("Cannot stat {}", path.display()))?
            .len() as usize;
        if file_len == 0 {
            return Ok(MmapBackend {
                mmap: None,
                len: 0,
                _marker: core::marker::PhantomData,
            });
        }
        let file = std::fs::File::open(path)
            .map_err(|e| crate::error::Error::io(path, e))
            .with_context(|| format!("Cannot open {} for MmapBackend", path.display()))?;
        // Round the mapping up to a multiple of 8 bytes so word-sized views
        // never read past the region.
        let capacity = file_len.div_ceil(8) * 8;
        let mmap = unsafe {
            mmap_rs::MmapOptions::new(capacity)
                .with_context(|| format!("Cannot initialize mmap of size {}", capacity))?
                .with_flags(MmapFlags::empty())
                .with_file(&file, 0)
                .map()
                .with_context(|| format!("Cannot mmap {} (size {})", path.display(), capacity))?
        };
        Ok(MmapBackend {
            len: file_len / core::mem::size_of::<W>(),
            mmap: Some(Arc::new(mmap)),
            _marker: core::marker::PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<W> AsRef<[W]> for MmapBackend<W> {
    fn as_ref(&self) -> &[W] {
        match &self.mmap {
            None => &[],
            Some(mmap) => unsafe {
                std::slice::from_raw_parts(mmap.as_ptr() as *const W, self.len)
            },
        }
    }
}
