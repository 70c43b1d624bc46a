/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Count modification: raw counts become left-continuation type counts.
//!
//! For every n-gram of order ≥ 2, each distinct left extension observed in
//! the corpus contributes one to the type count of its (n−1)-suffix.
//! N-grams starting with `<s>` keep their raw counts (nothing can precede
//! the sentence start), the `<s>` unigram keeps its own raw count, and the
//! highest order copies raw counts unchanged.

use super::{CountShard, NGramCounts};
use crate::vocab::BOS;
use crate::Id;
use anyhow::Result;
use dsi_progress_logger::*;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};

type ContextCount = (Vec<Id>, u64);

impl NGramCounts {
    /// Computes the modified counts; a mapper per shard walks its trie and
    /// routes each contribution to the shard owning the target n-gram,
    /// where a reducer accumulates.
    pub fn modify(&mut self) -> Result<()> {
        let num_shards = self.index.num_shards();
        let mut pl = ProgressLogger::default();
        pl.item_name("shard");
        pl.start("Modifying counts...");

        let failed = AtomicBool::new(false);
        let types = std::thread::scope(|scope| -> Result<Vec<Vec<u64>>> {
            let mut senders = Vec::with_capacity(num_shards);
            let mut reducers = Vec::with_capacity(num_shards);
            for shard in 0..num_shards {
                let (tx, rx) = crossbeam_channel::bounded::<ContextCount>(65536);
                senders.push(tx);
                let this = &*self;
                let failed = &failed;
                reducers.push(scope.spawn(move || -> Result<Vec<u64>> {
                    let trie = this.index.shard(shard);
                    let position_size = trie.position_size();
                    let mut modified = vec![0u64; position_size];
                    for (context, count) in rx {
                        if failed.load(Ordering::Relaxed) {
                            continue;
                        }
                        let (matched, pos) = trie.traverse(&context);
                        if matched != context.len() || pos == crate::NONE {
                            warn!("no n-gram node for ids {:?}", context);
                            continue;
                        }
                        modified[pos] += count;
                    }
                    // The highest order keeps its raw counts.
                    for pos in position_size..trie.size() {
                        modified.push(this.counts[shard].get(pos));
                    }
                    Ok(modified)
                }));
            }

            let mut mappers = Vec::with_capacity(num_shards);
            for shard in 0..num_shards {
                let senders = senders.clone();
                let this = &*self;
                let failed = &failed;
                mappers.push(scope.spawn(move || -> Result<()> {
                    let result = this.modify_map(shard, &senders);
                    if result.is_err() {
                        failed.store(true, Ordering::Relaxed);
                    }
                    result
                }));
            }
            drop(senders);

            let mut first_error = None;
            for mapper in mappers {
                if let Err(e) = mapper.join().expect("mapper panicked") {
                    first_error.get_or_insert(e);
                }
            }
            let mut types = Vec::with_capacity(num_shards);
            for reducer in reducers {
                match reducer.join().expect("reducer panicked") {
                    Ok(modified) => types.push(modified),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                None => Ok(types),
                Some(e) => Err(e),
            }
        })?;

        self.types = types.into_iter().map(CountShard::from_values).collect();
        pl.done();
        Ok(())
    }

    /// The mapper of one shard: emits `(target n-gram, contribution)`
    /// records.
    fn modify_map(
        &self,
        shard: usize,
        senders: &[crossbeam_channel::Sender<ContextCount>],
    ) -> Result<()> {
        let trie = self.index.shard(shard);
        let max_order = self.index.order();
        let unigrams = trie.offsets[1];
        let mut unigram_types = vec![0u64; unigrams];
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

                trie.path_ids(pos_context, &mut context);
                context.push(0);

                // The raw count of the <s> unigram is its own type count;
                // count it once, from the shard that owns unigram values.
                if shard == 0 && order_prev == 1 && context[0] == BOS {
                    unigram_types[BOS as usize] += self.counts[shard].get(pos_context);
                }

                for pos in pos_first..pos_last {
                    *context.last_mut().unwrap() = trie.index(pos);
                    if context.len() == 2 {
                        unigram_types[context[1] as usize] += 1;
                    } else {
                        let suffix = context[1..].to_vec();
                        let target = self.index.shard_index(&suffix);
                        senders[target]
                            .send((suffix, 1))
                            .map_err(|_| anyhow::anyhow!("reducer {} hung up", target))?;
                    }
                    if context[0] == BOS && order_prev + 1 != max_order {
                        let target = self.index.shard_index(&context);
                        senders[target]
                            .send((context.clone(), self.counts[shard].get(pos)))
                            .map_err(|_| anyhow::anyhow!("reducer {} hung up", target))?;
                    }
                }
            }
        }

        for (id, &count) in unigram_types.iter().enumerate() {
            if count > 0 {
                senders[0]
                    .send((vec![id as Id], count))
                    .map_err(|_| anyhow::anyhow!("reducer 0 hung up"))?;
            }
        }
        Ok(())
    }
}
