/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Upper-bound (logbound) computation.
//!
//! Every stored n-gram pushes its log-probability onto the shorter n-grams
//! a pruning query could reach it through; the per-shard reduce keeps the
//! maximum. Bounds are seeded from the n-gram's own log-probability (and
//! any bound the estimator already produced), so the result dominates both
//! the n-gram and its extensions. Below the highest order only n-grams
//! anchored at `<s>` contribute, matching the contexts a decoder can
//! actually be in.

use super::{NGramModel, ShardData};
use crate::vocab::BOS;
use crate::{Id, LOGPROB_MIN};
use anyhow::Result;
use dsi_progress_logger::*;
use log::warn;

type ContextBound = (Vec<Id>, f32);

impl NGramModel {
    /// Computes (or recomputes) the logbound arrays.
    pub fn bounds(&mut self) -> Result<()> {
        let num_shards = self.index.num_shards();
        let mut pl = ProgressLogger::default();
        pl.item_name("shard");
        pl.start("Computing upper bounds...");

        let results = std::thread::scope(|scope| -> Result<Vec<Vec<f32>>> {
            let mut senders = Vec::with_capacity(num_shards);
            let mut reducers = Vec::with_capacity(num_shards);
            for shard in 0..num_shards {
                let (tx, rx) = crossbeam_channel::bounded::<ContextBound>(65536);
                senders.push(tx);
                let this = &*self;
                reducers.push(scope.spawn(move || -> Result<Vec<f32>> {
                    let trie = this.index.shard(shard);
                    let mut bounds = vec![LOGPROB_MIN; trie.position_size()];
                    for order in 1..trie.order() {
                        for pos in trie.offsets[order - 1]..trie.offsets[order] {
                            let mut seed = this.logprob_at(shard, pos, order)?;
                            if this.has_bounds() && pos < this.logbounds[shard].len() {
                                seed = seed.max(this.logbounds[shard].get(pos, order)?);
                            }
                            bounds[pos] = seed;
                        }
                    }
                    for (context, logprob) in rx {
                        let (matched, pos) = trie.traverse(&context);
                        if matched != context.len() || pos == crate::NONE {
                            warn!("no n-gram node for bound target {:?}", context);
                            continue;
                        }
                        if logprob > bounds[pos] {
                            bounds[pos] = logprob;
                        }
                    }
                    Ok(bounds)
                }));
            }

            let mut mappers = Vec::with_capacity(num_shards);
            for shard in 0..num_shards {
                let senders = senders.clone();
                let this = &*self;
                mappers.push(
                    scope.spawn(move || -> Result<()> { this.bounds_map(shard, &senders) }),
                );
            }
            drop(senders);

            let mut first_error = None;
            for mapper in mappers {
                if let Err(e) = mapper.join().expect("bound mapper panicked") {
                    first_error.get_or_insert(e);
                }
            }
            let mut results = Vec::with_capacity(num_shards);
            for reducer in reducers {
                match reducer.join().expect("bound reducer panicked") {
                    Ok(bounds) => results.push(bounds),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                None => Ok(results),
                Some(e) => Err(e),
            }
        })?;

        self.logbounds = results
            .into_iter()
            .map(|bounds| ShardData::from_vec(bounds, 0))
            .collect();
        pl.done();
        Ok(())
    }

    fn bounds_map(
        &self,
        shard: usize,
        senders: &[crossbeam_channel::Sender<ContextBound>],
    ) -> Result<()> {
        let trie = self.index.shard(shard);
        let max_order = self.index.order();
        let backward = self.index.backward();
        let unigrams = trie.offsets[1];
        let mut unigram_bounds = vec![LOGPROB_MIN; unigrams];
        let mut context: Vec<Id> = Vec::new();

        for order_prev in 1..max_order {
            let pos_context_first = trie.offsets[order_prev - 1];
            let pos_context_last = trie.offsets[order_prev];
            let mut pos_last_prev = pos_context_last;
            for pos_context in pos_context_first..pos_context_last {
                let pos_first = pos_last_prev;
                let pos_last = trie.children_last(pos_context);
                pos_last_prev = pos_last;
                if pos_first == pos_last {
                    continue;
                }
                // Below the highest order only <s>-anchored n-grams are
                // mapped; the anchor sits at the deepest stored token under
                // backward storage and at the front otherwise.
                if backward && order_prev + 1 != max_order && trie.index(pos_context) != BOS {
                    continue;
                }
                trie.path_ids(pos_context, &mut context);
                context.push(0);
                if !backward && order_prev + 1 != max_order && context[0] != BOS {
                    continue;
                }

                let order = order_prev + 1;
                for pos in pos_first..pos_last {
                    *context.last_mut().unwrap() = trie.index(pos);
                    let logprob = self.logprob_at(shard, pos, order)?;
                    if logprob == LOGPROB_MIN {
                        continue;
                    }
                    let sub_end = context.len() - usize::from(backward);
                    let sub_begin = usize::from(!backward);
                    for i in sub_begin..sub_end {
                        let sub = &context[i..sub_end];
                        if sub.len() == 1 {
                            let id = sub[0] as usize;
                            if logprob > unigram_bounds[id] {
                                unigram_bounds[id] = logprob;
                            }
                        } else {
                            let target = self.index.shard_index(sub);
                            senders[target]
                                .send((sub.to_vec(), logprob))
                                .map_err(|_| anyhow::anyhow!("bound reducer {} hung up", target))?;
                        }
                    }
                }
            }
        }

        for (id, &bound) in unigram_bounds.iter().enumerate() {
            if bound > LOGPROB_MIN {
                senders[0]
                    .send((vec![id as Id], bound))
                    .map_err(|_| anyhow::anyhow!("bound reducer 0 hung up"))?;
            }
        }
        Ok(())
    }
}
