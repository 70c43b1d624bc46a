/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The estimated language model: the index plus per-shard value arrays.

mod arpa;
pub use arpa::*;

mod backward;
pub use backward::*;

mod bounds;
pub use bounds::*;

mod quantize;
pub use quantize::*;

mod query;
pub use query::*;

use crate::error::Error;
use crate::index::{shard_dir_name, NGramIndex};
use crate::properties::PropList;
use crate::storage::{BlockFile, BlockFileWriter, PackedVec};
use crate::LOGPROB_MIN;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

enum FloatSlice {
    Mem(Arc<Vec<f32>>),
    File(BlockFile<f32>),
}

impl FloatSlice {
    fn len(&self) -> usize {
        match self {
            FloatSlice::Mem(values) => values.len(),
            FloatSlice::File(file) => file.len(),
        }
    }

    fn get(&self, index: usize) -> Result<f32> {
        match self {
            FloatSlice::Mem(values) => match values.get(index) {
                Some(value) => Ok(*value),
                None => Err(Error::CorruptIndex(format!(
                    "value index {} out of range {}",
                    index,
                    values.len()
                ))
                .into()),
            },
            FloatSlice::File(file) => file.get(index),
        }
    }
}

impl Clone for FloatSlice {
    fn clone(&self) -> Self {
        match self {
            FloatSlice::Mem(values) => FloatSlice::Mem(values.clone()),
            FloatSlice::File(file) => FloatSlice::File(file.clone()),
        }
    }
}

/// One shard's worth of one value array, raw floats or an 8-bit
/// quantisation against per-order codebooks.
#[derive(Clone)]
pub struct ShardData {
    floats: Option<FloatSlice>,
    quantized: Option<PackedVec<u8>>,
    maps: Vec<[f32; 256]>,
    offset: usize,
}

impl std::fmt::Debug for ShardData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardData")
            .field("len", &self.len())
            .field("offset", &self.offset)
            .field("quantized", &self.quantized.is_some())
            .finish()
    }
}

impl Default for ShardData {
    fn default() -> Self {
        ShardData::from_vec(Vec::new(), 0)
    }
}

impl ShardData {
    pub fn from_vec(values: Vec<f32>, offset: usize) -> Self {
        ShardData {
            floats: Some(FloatSlice::Mem(Arc::new(values))),
            quantized: None,
            maps: Vec::new(),
            offset,
        }
    }

    pub fn from_quantized(codes: PackedVec<u8>, maps: Vec<[f32; 256]>, offset: usize) -> Self {
        ShardData {
            floats: None,
            quantized: Some(codes),
            maps,
            offset,
        }
    }

    pub fn is_quantized(&self) -> bool {
        self.quantized.is_some()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of positions covered, offset included.
    pub fn len(&self) -> usize {
        self.offset
            + match (&self.quantized, &self.floats) {
                (Some(codes), _) => codes.len(),
                (None, Some(floats)) => floats.len(),
                (None, None) => 0,
            }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value at a node position; `order` selects the codebook when
    /// quantised.
    pub fn get(&self, pos: usize, order: usize) -> Result<f32> {
        let index = pos - self.offset;
        if let Some(codes) = &self.quantized {
            return Ok(self.maps[order][codes.get(index) as usize]);
        }
        self.floats.as_ref().unwrap().get(index)
    }

    pub fn size_bytes(&self) -> usize {
        (self.len() - self.offset) * 4
    }

    pub fn size_compressed(&self) -> usize {
        match (&self.quantized, &self.floats) {
            (Some(codes), _) => codes.size_compressed() + self.maps.len() * 1024,
            (None, Some(FloatSlice::File(file))) => file.size_compressed(),
            _ => self.size_bytes(),
        }
    }

    /// Opens `dir`, holding either `<kind>` (raw or block-compressed) or
    /// `quantized` plus `<k>-<kind>-map` codebooks for `1..=order`.
    pub fn open(dir: impl AsRef<Path>, kind: &str, order: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let props = PropList::load(dir)?;
        let offset: usize = props.get_or("offset", 0)?;
        let quantized_path = dir.join("quantized");
        if quantized_path.exists() {
            let codes = PackedVec::open(&quantized_path)
                .with_context(|| format!("Cannot open {}", quantized_path.display()))?;
            let mut maps = vec![[0.0f32; 256]; order + 1];
            for (k, map) in maps.iter_mut().enumerate().skip(1) {
                let map_path = dir.join(format!("{}-{}-map", k, kind));
                let bytes = std::fs::read(&map_path)
                    .map_err(|e| Error::io(&map_path, e))
                    .with_context(|| format!("Cannot read {}", map_path.display()))?;
                if bytes.len() != 1024 {
                    return Err(Error::CorruptIndex(format!(
                        "codebook {} has {} bytes",
                        map_path.display(),
                        bytes.len()
                    ))
                    .into());
                }
                for (slot, chunk) in map.iter_mut().zip(bytes.chunks_exact(4)) {
                    *slot = f32::from_le_bytes(chunk.try_into().unwrap());
                }
            }
            return Ok(ShardData::from_quantized(codes, maps, offset));
        }
        let data_path = dir.join(kind);
        let file = BlockFile::<f32>::open(&data_path)
            .with_context(|| format!("Cannot open {}", data_path.display()))?;
        Ok(ShardData {
            floats: Some(FloatSlice::File(file)),
            quantized: None,
            maps: Vec::new(),
            offset,
        })
    }

    pub fn write(&self, dir: impl AsRef<Path>, kind: &str) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;
        if let Some(codes) = &self.quantized {
            codes.write(dir.join("quantized"))?;
            for (k, map) in self.maps.iter().enumerate().skip(1) {
                let mut bytes = Vec::with_capacity(1024);
                for value in map {
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
                let map_path = dir.join(format!("{}-{}-map", k, kind));
                std::fs::write(&map_path, bytes).map_err(|e| Error::io(&map_path, e))?;
            }
        } else {
            let mut writer = BlockFileWriter::<f32>::create(dir.join(kind))?;
            let floats = self.floats.as_ref().unwrap();
            for i in 0..floats.len() {
                writer.push(floats.get(i)?)?;
            }
            writer.finish()?;
        }
        let mut props = PropList::new();
        props.set("offset", self.offset);
        props.store(dir)
    }
}

/// A complete n-gram model: index, log-probabilities, back-offs and,
/// optionally, upper bounds.
#[derive(Debug, Clone, Default)]
pub struct NGramModel {
    pub index: NGramIndex,
    pub logprobs: Vec<ShardData>,
    pub backoffs: Vec<ShardData>,
    pub logbounds: Vec<ShardData>,
    pub smooth: f32,
}

impl NGramModel {
    pub fn logprob_min() -> f32 {
        LOGPROB_MIN
    }

    pub fn has_bounds(&self) -> bool {
        !self.logbounds.is_empty()
    }

    pub(crate) fn logprob_at(&self, shard: usize, pos: usize, order: usize) -> Result<f32> {
        self.logprobs[shard].get(pos, order)
    }

    pub(crate) fn backoff_at(&self, shard: usize, pos: usize, order: usize) -> Result<f32> {
        self.backoffs[shard].get(pos, order)
    }

    /// The upper bound at a position, falling back to the log-probability
    /// for positions past the bound arrays (the highest order).
    pub(crate) fn logbound_at(&self, shard: usize, pos: usize, order: usize) -> Result<f32> {
        if !self.logbounds.is_empty() && pos < self.logbounds[shard].len() {
            self.logbounds[shard].get(pos, order)
        } else {
            self.logprobs[shard].get(pos, order)
        }
    }

    /// Opens a model repository. `expected_shards` is checked against the
    /// stored shard count when given.
    pub fn open(dir: impl AsRef<Path>, expected_shards: Option<usize>) -> Result<Self> {
        let dir = dir.as_ref();
        let index = NGramIndex::open(dir, expected_shards)?;
        let props = PropList::load(dir)?;
        let smooth: f32 = props.require("smooth")?;
        let order = index.order();

        let mut logprobs = Vec::with_capacity(index.num_shards());
        let mut backoffs = Vec::with_capacity(index.num_shards());
        let mut logbounds = Vec::new();
        for shard in 0..index.num_shards() {
            let name = shard_dir_name("ngram", shard);
            logprobs.push(ShardData::open(
                dir.join("logprob").join(&name),
                "logprob",
                order,
            )?);
            backoffs.push(ShardData::open(
                dir.join("backoff").join(&name),
                "backoff",
                order,
            )?);
            let bound_dir = dir.join("logbound").join(&name);
            if bound_dir.exists() {
                logbounds.push(ShardData::open(bound_dir, "logbound", order)?);
            }
        }
        if !logbounds.is_empty() && logbounds.len() != index.num_shards() {
            return Err(Error::CorruptIndex(format!(
                "{}: {} logbound shards for {} index shards",
                dir.display(),
                logbounds.len(),
                index.num_shards()
            ))
            .into());
        }

        Ok(NGramModel {
            index,
            logprobs,
            backoffs,
            logbounds,
            smooth,
        })
    }

    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;
        self.index.write(dir)?;
        for shard in 0..self.index.num_shards() {
            let name = shard_dir_name("ngram", shard);
            self.logprobs[shard].write(dir.join("logprob").join(&name), "logprob")?;
            self.backoffs[shard].write(dir.join("backoff").join(&name), "backoff")?;
            if !self.logbounds.is_empty() {
                self.logbounds[shard].write(dir.join("logbound").join(&name), "logbound")?;
            }
        }
        let mut props = PropList::new();
        props.set("smooth", self.smooth);
        props.store(dir)
    }
}
