/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Modified Kneser-Ney probability estimation.
//!
//! Three phases over the counts: unigrams (single pass, shard 0), bigrams
//! (unigram contexts dealt round-robin to workers, children gathered across
//! every shard, the context back-off landing in shard 0's replicated
//! unigram section), then each higher order with one worker per shard.
//!
//! Workers of the higher orders read lower-order log-probabilities from
//! other shards while those are still being produced; a per-shard atomic
//! watermark publishes how far each worker has written, and readers spin
//! past it. Order k only ever needs order ≤ k−1, so the least advanced
//! worker can always make progress.
//!
//! Alongside the interpolated probabilities, a second estimate discounted
//! with the raw (unmodified) counts is kept per n-gram; it seeds the upper
//! bounds used for admissible pruning.

use super::{Discount, NGramCounts};
use crate::error::Error;
use crate::model::{NGramModel, ShardData};
use crate::vocab::{BOS, UNK};
use crate::{logprob_bos, Id, LOGPROB_MIN, NONE};
use anyhow::Result;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

#[inline(always)]
fn load_f32(slot: &AtomicU32) -> f32 {
    f32::from_bits(slot.load(Ordering::Acquire))
}

#[inline(always)]
fn store_f32(slot: &AtomicU32, value: f32) {
    slot.store(value.to_bits(), Ordering::Release)
}

/// log(exp(a) + exp(b)) without leaving log space.
#[inline(always)]
pub(crate) fn log_add(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY {
        hi
    } else {
        hi + (lo - hi).exp().ln_1p()
    }
}

fn min_bits(len: usize) -> Vec<AtomicU32> {
    (0..len).map(|_| AtomicU32::new(LOGPROB_MIN.to_bits())).collect()
}

fn zero_bits(len: usize) -> Vec<AtomicU32> {
    (0..len).map(|_| AtomicU32::new(0.0f32.to_bits())).collect()
}

fn into_f32(values: Vec<AtomicU32>) -> Vec<f32> {
    values
        .into_iter()
        .map(|slot| f32::from_bits(slot.into_inner()))
        .collect()
}

/// The shared mutable state of the estimation phases.
struct Arrays {
    logprobs: Vec<Vec<AtomicU32>>,
    backoffs: Vec<Vec<AtomicU32>>,
    logbounds: Vec<Vec<AtomicU32>>,
    watermarks: Vec<AtomicUsize>,
    failed: AtomicBool,
}

impl NGramCounts {
    /// Estimates the model. Requires [`modify`](NGramCounts::modify) to
    /// have produced the type counts.
    pub fn estimate(&self, remove_unk: bool) -> Result<NGramModel> {
        anyhow::ensure!(
            self.has_types(),
            "type counts are required for estimation; modify the counts first"
        );
        let index = &self.index;
        let num_shards = index.num_shards();
        let max_order = index.order();

        let (cc_types, cc_raw) = self.count_of_counts(remove_unk);
        let mut discounts = vec![Discount::default(); max_order + 1];
        let mut discounts_raw = vec![Discount::default(); max_order + 1];
        for order in 1..=max_order {
            discounts[order] = Discount::estimate(&cc_types[order])?;
            discounts_raw[order] = Discount::estimate(&cc_raw[order])?;
            debug!("type counts: order: {} {}", order, discounts[order]);
            debug!("raw counts:  order: {} {}", order, discounts_raw[order]);
        }

        let arrays = Arrays {
            logprobs: index.shards().iter().map(|s| min_bits(s.size())).collect(),
            backoffs: index
                .shards()
                .iter()
                .map(|s| zero_bits(s.position_size()))
                .collect(),
            logbounds: index
                .shards()
                .iter()
                .map(|s| min_bits(s.position_size()))
                .collect(),
            watermarks: index
                .shards()
                .iter()
                .map(|s| AtomicUsize::new(s.offsets.get(2).copied().unwrap_or_else(|| s.size())))
                .collect(),
            failed: AtomicBool::new(false),
        };

        info!("estimating unigrams");
        let smooth = self.estimate_unigrams(remove_unk, &discounts, &discounts_raw, &arrays)?;
        debug!("smooth: {}", smooth);

        if max_order > 1 {
            info!("estimating bigrams");
            run_shards(num_shards, &arrays.failed, |shard| {
                self.estimate_bigrams(shard, remove_unk, &discounts, &discounts_raw, &arrays)
            })?;
        }

        if max_order > 2 {
            info!("estimating orders 3..={}", max_order);
            run_shards(num_shards, &arrays.failed, |shard| {
                self.estimate_higher(shard, remove_unk, &discounts, &discounts_raw, &arrays)
            })?;
        }

        Ok(NGramModel {
            index: index.clone(),
            logprobs: arrays
                .logprobs
                .into_iter()
                .map(|values| ShardData::from_vec(into_f32(values), 0))
                .collect(),
            backoffs: arrays
                .backoffs
                .into_iter()
                .map(|values| ShardData::from_vec(into_f32(values), 0))
                .collect(),
            logbounds: if max_order > 1 {
                arrays
                    .logbounds
                    .into_iter()
                    .map(|values| ShardData::from_vec(into_f32(values), 0))
                    .collect()
            } else {
                Vec::new()
            },
            smooth,
        })
    }

    /// Counts-of-counts per order, over type and raw counts.
    #[allow(clippy::type_complexity)]
    fn count_of_counts(
        &self,
        remove_unk: bool,
    ) -> (Vec<HashMap<u64, u64>>, Vec<HashMap<u64, u64>>) {
        let max_order = self.index.order();
        let mut cc_types = vec![HashMap::new(); max_order + 1];
        let mut cc_raw = vec![HashMap::new(); max_order + 1];
        for shard in 0..self.index.num_shards() {
            let trie = self.index.shard(shard);
            for order in 1..=max_order {
                // The unigram section is replicated; count it once.
                if order == 1 && shard != 0 {
                    continue;
                }
                for pos in trie.offsets[order - 1]..trie.offsets[order] {
                    if remove_unk && trie.index(pos) == UNK {
                        continue;
                    }
                    let types = self.types[shard].get(pos);
                    if types > 0 {
                        *cc_types[order].entry(types).or_insert(0) += 1;
                    }
                    let raw = self.counts[shard].get(pos);
                    if raw > 0 {
                        *cc_raw[order].entry(raw).or_insert(0) += 1;
                    }
                }
            }
        }
        (cc_types, cc_raw)
    }

    fn estimate_unigrams(
        &self,
        remove_unk: bool,
        discounts: &[Discount],
        discounts_raw: &[Discount],
        arrays: &Arrays,
    ) -> Result<f32> {
        let unigrams = self.index.unigrams();
        let max_order = self.index.order();
        let types = &self.types[0];
        let counts = &self.counts[0];
        let bos = BOS as usize;
        let unk = UNK as usize;
        let d = &discounts[1];

        let is_zero_event = |pos: usize, count: u64| count == 0 || (remove_unk && pos == unk);

        let mut total = 0u64;
        let mut observed = 0u64;
        let mut min2 = 0u64;
        let mut min3 = 0u64;
        let mut zero_events = 0u64;
        for pos in 0..unigrams {
            if pos == bos {
                continue;
            }
            let count = types.get(pos);
            if is_zero_event(pos, count) {
                zero_events += 1;
                continue;
            }
            total += count;
            observed += 1;
            min2 += u64::from(count >= d.mincount2);
            min3 += u64::from(count >= d.mincount3);
        }
        if observed == 0 || total == 0 {
            return Err(Error::Numeric("no observed unigram events".into()).into());
        }

        let uniform = 1.0 / observed as f64;
        let mut smooth = LOGPROB_MIN;
        let mut logsum = 0.0f64;
        while logsum >= 0.0 {
            logsum = f64::NEG_INFINITY;
            for pos in 0..unigrams {
                if pos == bos {
                    continue;
                }
                let count = types.get(pos);
                if is_zero_event(pos, count) {
                    continue;
                }
                let prob = d.discount(count) * count as f64 / total as f64;
                let weight = d.lower_order_weight(total, observed, min2, min3);
                let logprob = (prob + weight * uniform).ln() as f32;
                store_f32(&arrays.logprobs[0][pos], logprob);
                if pos == unk {
                    smooth = logprob;
                }
                logsum = log_add(logsum, logprob as f64);
            }
            total += 1;
        }

        let discounted_mass = -logsum.exp_m1();
        if discounted_mass > 0.0 {
            if zero_events > 0 {
                // Distribute the leftover mass to the zero events; with
                // remove-unk this is where <unk> gets its probability even
                // when it was observed.
                let logdistribute =
                    (discounted_mass.ln() - (zero_events as f64).ln()) as f32;
                for pos in 0..unigrams {
                    if pos != bos && is_zero_event(pos, types.get(pos)) {
                        store_f32(&arrays.logprobs[0][pos], logdistribute);
                    }
                }
                if smooth == LOGPROB_MIN {
                    smooth = logdistribute;
                }
            } else {
                for pos in 0..unigrams {
                    if pos == bos || is_zero_event(pos, types.get(pos)) {
                        continue;
                    }
                    let renormalized =
                        (load_f32(&arrays.logprobs[0][pos]) as f64 - logsum) as f32;
                    store_f32(&arrays.logprobs[0][pos], renormalized);
                    if pos == unk {
                        smooth = renormalized;
                    }
                }
            }
        }

        store_f32(&arrays.logprobs[0][bos], logprob_bos());
        if smooth == LOGPROB_MIN {
            smooth = uniform.ln() as f32;
        }

        // Seed the unigram bounds from the raw counts.
        if max_order > 1 {
            let d = &discounts_raw[1];
            let mut total = 0u64;
            let mut observed = 0u64;
            let mut min2 = 0u64;
            let mut min3 = 0u64;
            for pos in 0..unigrams {
                if pos == bos {
                    continue;
                }
                let count = counts.get(pos);
                if is_zero_event(pos, count) {
                    continue;
                }
                total += count;
                observed += 1;
                min2 += u64::from(count >= d.mincount2);
                min3 += u64::from(count >= d.mincount3);
            }
            if total > 0 {
                for pos in 0..unigrams {
                    if pos == bos {
                        continue;
                    }
                    let count = counts.get(pos);
                    if is_zero_event(pos, count) {
                        continue;
                    }
                    let prob = d.discount(count) * count as f64 / total as f64;
                    let weight = d.lower_order_weight(total, observed, min2, min3);
                    store_f32(
                        &arrays.logbounds[0][pos],
                        (prob + weight * uniform).ln() as f32,
                    );
                }
            }
        }
        Ok(smooth)
    }

    /// Bigram contexts are single unigrams whose children scatter across
    /// every shard; worker `shard` owns the contexts `u % S == shard`.
    fn estimate_bigrams(
        &self,
        shard: usize,
        remove_unk: bool,
        discounts: &[Discount],
        discounts_raw: &[Discount],
        arrays: &Arrays,
    ) -> Result<()> {
        let index = &self.index;
        let num_shards = index.num_shards();
        let unigrams = index.unigrams();
        let max_order = index.order();
        let order = 2;

        for context in 0..unigrams {
            if context % num_shards != shard {
                continue;
            }
            let ranges: Vec<(usize, usize, usize)> = (0..num_shards)
                .map(|s| {
                    let trie = index.shard(s);
                    (s, trie.children_first(context), trie.children_last(context))
                })
                .collect();

            // Raw-count estimates seed the bounds.
            if max_order > 2 {
                let d = &discounts_raw[order];
                let mut total = 0u64;
                let mut observed = 0u64;
                let mut min2 = 0u64;
                let mut min3 = 0u64;
                for &(s, first, last) in &ranges {
                    let trie = index.shard(s);
                    for pos in first..last {
                        if remove_unk && trie.index(pos) == UNK {
                            continue;
                        }
                        let count = self.counts[s].get(pos);
                        if count == 0 {
                            continue;
                        }
                        total += count;
                        observed += 1;
                        min2 += u64::from(count >= d.mincount2);
                        min3 += u64::from(count >= d.mincount3);
                    }
                }
                if total > 0 {
                    for &(s, first, last) in &ranges {
                        let trie = index.shard(s);
                        for pos in first..last {
                            let id = trie.index(pos);
                            if remove_unk && id == UNK {
                                continue;
                            }
                            let count = self.counts[s].get(pos);
                            if count == 0 {
                                continue;
                            }
                            let prob = d.discount(count) * count as f64 / total as f64;
                            let weight = d.lower_order_weight(total, observed, min2, min3);
                            let lower = load_f32(&arrays.logprobs[0][id as usize]) as f64;
                            store_f32(
                                &arrays.logbounds[s][pos],
                                (prob + weight * lower.exp()).ln() as f32,
                            );
                        }
                    }
                }
            }

            let d = &discounts[order];
            let mut total = 0u64;
            let mut observed = 0u64;
            let mut min2 = 0u64;
            let mut min3 = 0u64;
            let mut logsum_lower = f64::NEG_INFINITY;
            for &(s, first, last) in &ranges {
                let trie = index.shard(s);
                for pos in first..last {
                    let id = trie.index(pos);
                    if remove_unk && id == UNK {
                        continue;
                    }
                    let count = self.types[s].get(pos);
                    if count == 0 {
                        continue;
                    }
                    total += count;
                    observed += 1;
                    min2 += u64::from(count >= d.mincount2);
                    min3 += u64::from(count >= d.mincount3);
                    logsum_lower =
                        log_add(logsum_lower, load_f32(&arrays.logprobs[0][id as usize]) as f64);
                }
            }
            if total == 0 {
                continue;
            }

            let mut logsum = 0.0f64;
            while logsum >= 0.0 {
                logsum = f64::NEG_INFINITY;
                for &(s, first, last) in &ranges {
                    let trie = index.shard(s);
                    for pos in first..last {
                        let id = trie.index(pos);
                        if remove_unk && id == UNK {
                            continue;
                        }
                        let count = self.types[s].get(pos);
                        if count == 0 {
                            continue;
                        }
                        let prob = d.discount(count) * count as f64 / total as f64;
                        let weight = d.lower_order_weight(total, observed, min2, min3);
                        let lower = load_f32(&arrays.logprobs[0][id as usize]) as f64;
                        let logprob = (prob + weight * lower.exp()).ln() as f32;
                        logsum = log_add(logsum, logprob as f64);
                        store_f32(&arrays.logprobs[s][pos], logprob);
                    }
                }
                total += 1;
            }

            let numerator = -logsum.exp_m1();
            let denominator = -logsum_lower.exp_m1();
            if numerator > 0.0 {
                if denominator > 0.0 {
                    // Unigram-context back-offs always live in shard 0.
                    store_f32(
                        &arrays.backoffs[0][context],
                        (numerator.ln() - denominator.ln()) as f32,
                    );
                } else {
                    for &(s, first, last) in &ranges {
                        let trie = index.shard(s);
                        for pos in first..last {
                            if self.types[s].get(pos) != 0
                                && (!remove_unk || trie.index(pos) != UNK)
                            {
                                let renormalized =
                                    (load_f32(&arrays.logprobs[s][pos]) as f64 - logsum) as f32;
                                store_f32(&arrays.logprobs[s][pos], renormalized);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Orders three and above: one worker per shard, publishing a position
    /// watermark as it goes.
    fn estimate_higher(
        &self,
        shard: usize,
        remove_unk: bool,
        discounts: &[Discount],
        discounts_raw: &[Discount],
        arrays: &Arrays,
    ) -> Result<()> {
        let index = &self.index;
        let trie = index.shard(shard);
        let max_order = index.order();
        let mut context: Vec<Id> = Vec::new();
        let mut lowers: Vec<f32> = Vec::new();

        for order_prev in 2..max_order {
            let order = order_prev + 1;
            debug!("order: {} shard: {}", order, shard);
            let pos_context_first = trie.offsets[order_prev - 1];
            let pos_context_last = trie.offsets[order_prev];
            let mut pos_last_prev = pos_context_last;

            for pos_context in pos_context_first..pos_context_last {
                let pos_first = pos_last_prev;
                let pos_last = trie.children_last(pos_context);
                pos_last_prev = pos_last;
                arrays.watermarks[shard].store(pos_first, Ordering::Release);
                if pos_first == pos_last {
                    continue;
                }

                trie.path_ids(pos_context, &mut context);
                context.push(0);

                // Lower-order probabilities of every child, via the
                // back-off walk over the other shards.
                lowers.clear();
                lowers.resize(pos_last - pos_first, LOGPROB_MIN);
                for pos in pos_first..pos_last {
                    let id = trie.index(pos);
                    if remove_unk && id == UNK {
                        continue;
                    }
                    *context.last_mut().unwrap() = id;
                    lowers[pos - pos_first] = self.logprob_backoff(&context[1..], arrays)?;
                }

                // Raw-count estimates seed the bounds.
                if max_order > order {
                    let d = &discounts_raw[order];
                    let mut total = 0u64;
                    let mut observed = 0u64;
                    let mut min2 = 0u64;
                    let mut min3 = 0u64;
                    for pos in pos_first..pos_last {
                        if remove_unk && trie.index(pos) == UNK {
                            continue;
                        }
                        let count = self.counts[shard].get(pos);
                        if count == 0 {
                            continue;
                        }
                        total += count;
                        observed += 1;
                        min2 += u64::from(count >= d.mincount2);
                        min3 += u64::from(count >= d.mincount3);
                    }
                    if total > 0 {
                        for pos in pos_first..pos_last {
                            if remove_unk && trie.index(pos) == UNK {
                                continue;
                            }
                            let count = self.counts[shard].get(pos);
                            if count == 0 {
                                continue;
                            }
                            let prob = d.discount(count) * count as f64 / total as f64;
                            let weight = d.lower_order_weight(total, observed, min2, min3);
                            let lower = lowers[pos - pos_first] as f64;
                            store_f32(
                                &arrays.logbounds[shard][pos],
                                (prob + weight * lower.exp()).ln() as f32,
                            );
                        }
                    }
                }

                let d = &discounts[order];
                let mut total = 0u64;
                let mut observed = 0u64;
                let mut min2 = 0u64;
                let mut min3 = 0u64;
                let mut logsum_lower = f64::NEG_INFINITY;
                for pos in pos_first..pos_last {
                    if remove_unk && trie.index(pos) == UNK {
                        continue;
                    }
                    let count = self.types[shard].get(pos);
                    if count == 0 {
                        continue;
                    }
                    total += count;
                    observed += 1;
                    min2 += u64::from(count >= d.mincount2);
                    min3 += u64::from(count >= d.mincount3);
                    logsum_lower = log_add(logsum_lower, lowers[pos - pos_first] as f64);
                }
                if total == 0 {
                    continue;
                }

                let mut logsum = 0.0f64;
                while logsum >= 0.0 {
                    logsum = f64::NEG_INFINITY;
                    for pos in pos_first..pos_last {
                        if remove_unk && trie.index(pos) == UNK {
                            continue;
                        }
                        let count = self.types[shard].get(pos);
                        if count == 0 {
                            continue;
                        }
                        let prob = d.discount(count) * count as f64 / total as f64;
                        let weight = d.lower_order_weight(total, observed, min2, min3);
                        let lower = lowers[pos - pos_first] as f64;
                        let logprob = (prob + weight * lower.exp()).ln() as f32;
                        logsum = log_add(logsum, logprob as f64);
                        store_f32(&arrays.logprobs[shard][pos], logprob);
                    }
                    total += 1;
                }

                let numerator = -logsum.exp_m1();
                let denominator = -logsum_lower.exp_m1();
                if numerator > 0.0 {
                    if denominator > 0.0 {
                        store_f32(
                            &arrays.backoffs[shard][pos_context],
                            (numerator.ln() - denominator.ln()) as f32,
                        );
                    } else {
                        for pos in pos_first..pos_last {
                            if self.types[shard].get(pos) != 0
                                && (!remove_unk || trie.index(pos) != UNK)
                            {
                                let renormalized =
                                    (load_f32(&arrays.logprobs[shard][pos]) as f64 - logsum)
                                        as f32;
                                store_f32(&arrays.logprobs[shard][pos], renormalized);
                            }
                        }
                    }
                }
                arrays.watermarks[shard].store(pos_last, Ordering::Release);
            }
        }
        // Everything this shard will ever produce is now readable.
        arrays.watermarks[shard].store(trie.size(), Ordering::Release);
        Ok(())
    }

    /// The back-off-interpolated log-probability of a forward n-gram,
    /// reading lower orders that other shards may still be producing.
    fn logprob_backoff(&self, key: &[Id], arrays: &Arrays) -> Result<f32> {
        let index = &self.index;
        let mut logbackoff = 0.0f32;
        for start in 0..key.len() - 1 {
            let sub = &key[start..];
            let order = sub.len();
            let shard = index.shard_index(sub);
            // Bigram back-offs read the unigram section of shard 0.
            let shard_backoff = if order == 2 { 0 } else { shard };
            let (matched, pos) = index.traverse(shard, sub);
            if matched == sub.len() {
                while arrays.watermarks[shard].load(Ordering::Acquire) <= pos {
                    if arrays.failed.load(Ordering::Relaxed) {
                        return Err(Error::Numeric(
                            "estimation aborted by another worker".into(),
                        )
                        .into());
                    }
                    std::thread::yield_now();
                }
                let logprob = load_f32(&arrays.logprobs[shard][pos]);
                if logprob != LOGPROB_MIN {
                    return Ok(logbackoff + logprob);
                }
                let parent = index.shard(shard).parent(pos);
                if parent != NONE {
                    logbackoff += load_f32(&arrays.backoffs[shard_backoff][parent]);
                }
            } else if matched == sub.len() - 1 {
                logbackoff += load_f32(&arrays.backoffs[shard_backoff][pos]);
            }
        }
        Ok(logbackoff + load_f32(&arrays.logprobs[0][key[key.len() - 1] as usize]))
    }
}

/// Spawns one worker per shard, records the first failure and lets the
/// other workers drain.
fn run_shards(
    num_shards: usize,
    failed: &AtomicBool,
    work: impl Fn(usize) -> Result<()> + Sync,
) -> Result<()> {
    std::thread::scope(|scope| {
        let work = &work;
        let handles: Vec<_> = (0..num_shards)
            .map(|shard| {
                scope.spawn(move || {
                    let result = work(shard);
                    if result.is_err() {
                        failed.store(true, Ordering::Relaxed);
                    }
                    result
                })
            })
            .collect();
        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.join().expect("estimation worker panicked") {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    })
}
