/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! 8-bit quantisation of the value arrays.
//!
//! Each order of each shard gets a 256-entry codebook built by equal
//! frequency bucketing; a bucket is represented by its median. The absence
//! sentinel must survive quantisation exactly, so when present it is
//! pinned to code 0.

use super::{NGramModel, ShardData};
use crate::storage::PackedVecBuilder;
use crate::LOGPROB_MIN;
use anyhow::Result;
use log::info;

/// A per-order codebook and the boundaries used to assign codes.
struct Codebook {
    map: [f32; 256],
    lower_bounds: Vec<f32>,
    has_sentinel: bool,
}

impl Codebook {
    fn build(values: &[f32]) -> Self {
        let has_sentinel = values.iter().any(|&v| v == LOGPROB_MIN);
        let mut sorted: Vec<f32> = values
            .iter()
            .copied()
            .filter(|&v| {
                // Value arrays never hold NaN: every stored entry is the
                // log of a positive sum, and invalid discounts fall back
                // to finite constants (counts/discount.rs). The unwrap in
                // the sort below relies on this.
                debug_assert!(!v.is_nan());
                v != LOGPROB_MIN
            })
            .collect();
        sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());

        let mut map = [0.0f32; 256];
        let base = usize::from(has_sentinel);
        if has_sentinel {
            map[0] = LOGPROB_MIN;
        }
        let buckets = 256 - base;
        let len = sorted.len();
        let used = buckets.min(len);
        let mut lower_bounds = Vec::with_capacity(used);
        for bucket in 0..used {
            let lo = bucket * len / used;
            let hi = ((bucket + 1) * len / used).max(lo + 1);
            map[base + bucket] = sorted[lo + (hi - lo) / 2];
            lower_bounds.push(sorted[lo]);
        }
        Codebook {
            map,
            lower_bounds,
            has_sentinel,
        }
    }

    fn code(&self, value: f32) -> u8 {
        if value == LOGPROB_MIN {
            debug_assert!(self.has_sentinel);
            return 0;
        }
        let base = usize::from(self.has_sentinel);
        if self.lower_bounds.is_empty() {
            return 0;
        }
        let bucket = self
            .lower_bounds
            .partition_point(|&lo| lo <= value)
            .saturating_sub(1);
        (base + bucket) as u8
    }
}

fn quantize_shard(
    data: &ShardData,
    order_ranges: &[(usize, usize, usize)],
    max_order: usize,
) -> Result<ShardData> {
    let offset = data.offset();
    let mut maps = vec![[0.0f32; 256]; max_order + 1];
    let mut books = Vec::with_capacity(order_ranges.len());
    for &(order, first, last) in order_ranges {
        let mut values = Vec::with_capacity(last - first);
        for pos in first..last {
            values.push(data.get(pos, order)?);
        }
        let book = Codebook::build(&values);
        maps[order] = book.map;
        books.push(book);
    }

    let mut codes = PackedVecBuilder::<u8>::new();
    for (&(order, first, last), book) in order_ranges.iter().zip(&books) {
        for pos in first..last {
            codes.push(book.code(data.get(pos, order)?));
        }
    }
    Ok(ShardData::from_quantized(codes.build(), maps, offset))
}

impl NGramModel {
    /// Replaces every value array with its 8-bit quantisation.
    pub fn quantize(&mut self) -> Result<()> {
        let index = self.index.clone();
        info!("quantizing {} shards", index.num_shards());
        for shard in 0..index.num_shards() {
            let trie = index.shard(shard);

            // Contiguous (order, first, last) position ranges of an array.
            let ranges = |len: usize| -> Vec<(usize, usize, usize)> {
                (1..=trie.order())
                    .map(|order| {
                        (
                            order,
                            trie.offsets[order - 1].min(len),
                            trie.offsets[order].min(len),
                        )
                    })
                    .filter(|&(_, first, last)| first < last)
                    .collect()
            };

            let order = trie.order();
            let logprob_ranges = ranges(self.logprobs[shard].len());
            self.logprobs[shard] =
                quantize_shard(&self.logprobs[shard], &logprob_ranges, order)?;
            let backoff_ranges = ranges(self.backoffs[shard].len());
            self.backoffs[shard] =
                quantize_shard(&self.backoffs[shard], &backoff_ranges, order)?;
            if self.has_bounds() {
                let bound_ranges = ranges(self.logbounds[shard].len());
                self.logbounds[shard] =
                    quantize_shard(&self.logbounds[shard], &bound_ranges, order)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codebook_round_trip_exact_small_sets() {
        // Fewer than 256 distinct values: every value is its own bucket.
        let values: Vec<f32> = (0..100).map(|i| -(i as f32) / 7.0).collect();
        let book = Codebook::build(&values);
        for &v in &values {
            assert_eq!(book.map[book.code(v) as usize], v);
        }
    }

    #[test]
    fn test_sentinel_is_pinned() {
        let values = vec![LOGPROB_MIN, -1.0, -2.0, LOGPROB_MIN];
        let book = Codebook::build(&values);
        assert_eq!(book.code(LOGPROB_MIN), 0);
        assert_eq!(book.map[0], LOGPROB_MIN);
        assert_ne!(book.code(-1.0), 0);
    }

    #[test]
    fn test_bucket_error_bounded() {
        // 10k values into 256 buckets: the error is at most the bucket
        // width.
        let values: Vec<f32> = (0..10_000).map(|i| (i as f32).sqrt()).collect();
        let book = Codebook::build(&values);
        let mut max_width = 0.0f32;
        for window in values.windows(40) {
            max_width = max_width.max(window[39] - window[0]);
        }
        for &v in &values {
            let dequantized = book.map[book.code(v) as usize];
            assert!((dequantized - v).abs() <= max_width);
        }
    }
}
