/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Raw and modified n-gram counts over the sharded index.

mod discount;
pub use discount::*;

mod estimate;
pub use estimate::*;

mod extract;
pub use extract::*;

mod google;
pub use google::*;

mod modify;
pub use modify::*;

use crate::error::Error;
use crate::index::{shard_dir_name, NGramIndex, ShardIndexer};
use crate::properties::PropList;
use crate::storage::PackedVec;
use crate::vocab::VocabularyBuilder;
use crate::Id;
use anyhow::{Context, Result};
use dsi_progress_logger::*;
use log::info;
use std::path::Path;

/// One shard's count array, aligned with the shard's node positions.
#[derive(Debug, Clone, Default)]
pub struct CountShard {
    pub counts: PackedVec<u64>,
    pub offset: usize,
}

impl CountShard {
    pub fn from_values(values: Vec<u64>) -> Self {
        CountShard {
            counts: PackedVec::from_values(values),
            offset: 0,
        }
    }

    #[inline(always)]
    pub fn get(&self, pos: usize) -> u64 {
        self.counts.get(pos - self.offset)
    }

    pub fn len(&self) -> usize {
        self.offset + self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let props = PropList::load(dir)?;
        let offset: usize = props.get_or("offset", 0)?;
        let counts = PackedVec::open(dir.join("count"))
            .with_context(|| format!("Cannot open counts of {}", dir.display()))?;
        Ok(CountShard { counts, offset })
    }

    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;
        self.counts.write(dir.join("count"))?;
        let mut props = PropList::new();
        props.set("offset", self.offset);
        props.store(dir)
    }
}

/// A counts repository: the index plus raw counts and, after
/// [`modify`](NGramCounts::modify), the left-continuation type counts.
#[derive(Debug, Clone, Default)]
pub struct NGramCounts {
    pub index: NGramIndex,
    pub counts: Vec<CountShard>,
    pub types: Vec<CountShard>,
}

impl NGramCounts {
    pub fn has_types(&self) -> bool {
        !self.types.is_empty()
    }

    pub fn open(dir: impl AsRef<Path>, expected_shards: Option<usize>) -> Result<Self> {
        let dir = dir.as_ref();
        let index = NGramIndex::open(dir, expected_shards)?;
        let mut counts = Vec::with_capacity(index.num_shards());
        let mut types = Vec::new();
        for shard in 0..index.num_shards() {
            let name = shard_dir_name("ngram", shard);
            counts.push(CountShard::open(dir.join("count").join(&name))?);
            let type_dir = dir.join("type").join(&name);
            if type_dir.exists() {
                types.push(CountShard::open(type_dir)?);
            }
        }
        if !types.is_empty() && types.len() != index.num_shards() {
            return Err(Error::CorruptIndex(format!(
                "{}: {} type shards for {} index shards",
                dir.display(),
                types.len(),
                index.num_shards()
            ))
            .into());
        }
        Ok(NGramCounts {
            index,
            counts,
            types,
        })
    }

    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;
        self.index.write(dir)?;
        for shard in 0..self.index.num_shards() {
            let name = shard_dir_name("ngram", shard);
            self.counts[shard].write(dir.join("count").join(&name))?;
            if !self.types.is_empty() {
                self.types[shard].write(dir.join("type").join(&name))?;
            }
        }
        let mut props = PropList::new();
        props.set("shard", self.index.num_shards());
        props.store(dir)
    }
}

/// One group of an order's sorted stream: a prefix and its (word, count)
/// continuations.
type Group = (Vec<Id>, Vec<(Id, u64)>);

/// Builds a counts repository from sorted Google-layout count files.
///
/// Orders are indexed one by one: a mapper routes each prefix group to the
/// shard owning it (order-2 groups are split per word, as bigrams shard by
/// themselves) and per-shard reducers append to their tries; a higher order
/// can only be inserted below an already indexed prefix.
pub fn index_counts(
    source: &GoogleCounts,
    max_order: usize,
    num_shards: usize,
) -> Result<NGramCounts> {
    anyhow::ensure!(num_shards > 0, "at least one shard is required");
    let max_order = max_order.min(source.order());

    // The vocabulary and the unigram counts come from the sorted unigram
    // stream; ids beyond the reserved three are dense in stream order.
    let mut builder = VocabularyBuilder::new();
    let mut unigram_counts = vec![0u64; builder.len()];
    for record in source.iter_order(1)? {
        let (tokens, count) = record?;
        let id = builder.insert(&tokens[0]) as usize;
        if id >= unigram_counts.len() {
            unigram_counts.resize(id + 1, 0);
        }
        unigram_counts[id] += count;
    }
    let vocab = builder.build();
    unigram_counts.resize(vocab.len(), 0);
    info!("vocabulary: {} words", vocab.len());

    let mut index = NGramIndex::with_unigrams(vocab, num_shards, false);
    // Unigram counts are replicated into every shard's array.
    let mut count_values: Vec<Vec<u64>> = vec![unigram_counts; num_shards];

    for order in 2..=max_order {
        let mut pl = ProgressLogger::default();
        pl.item_name("ngram").display_memory(true);
        pl.start(format!("Indexing {}-grams...", order));

        let appended = std::thread::scope(|scope| -> Result<Vec<ShardIndexer<u64>>> {
            let mut senders = Vec::with_capacity(num_shards);
            let mut handles = Vec::with_capacity(num_shards);
            for shard in 0..num_shards {
                let (tx, rx) = crossbeam_channel::bounded::<Group>(65536);
                senders.push(tx);
                let trie = index.shard(shard);
                handles.push(scope.spawn(move || -> Result<ShardIndexer<u64>> {
                    let mut indexer = ShardIndexer::new(trie);
                    for (prefix, mut words) in rx {
                        indexer.append(trie, &prefix, &mut words)?;
                    }
                    Ok(indexer)
                }));
            }

            let mut dispatch = |prefix: &[Id], words: &mut Vec<(Id, u64)>| -> Result<()> {
                if words.is_empty() {
                    return Ok(());
                }
                if order == 2 {
                    // Bigrams shard by themselves, so one unigram prefix
                    // scatters.
                    words.sort_unstable_by_key(|&(id, _)| id);
                    let mut per_shard: Vec<Vec<(Id, u64)>> = vec![Vec::new(); num_shards];
                    for &(word, count) in words.iter() {
                        per_shard[index.shard_index(&[prefix[0], word])].push((word, count));
                    }
                    for (shard, run) in per_shard.into_iter().enumerate() {
                        if !run.is_empty() {
                            senders[shard]
                                .send((prefix.to_vec(), run))
                                .map_err(|_| anyhow::anyhow!("reducer {} hung up", shard))?;
                        }
                    }
                } else {
                    let shard = index.shard_index(prefix);
                    senders[shard]
                        .send((prefix.to_vec(), std::mem::take(words)))
                        .map_err(|_| anyhow::anyhow!("reducer {} hung up", shard))?;
                }
                words.clear();
                Ok(())
            };

            let mut prefix: Vec<Id> = Vec::new();
            let mut words: Vec<(Id, u64)> = Vec::new();
            let mut ids = Vec::with_capacity(order);
            for record in source.iter_order(order)? {
                let (tokens, count) = record?;
                if tokens.len() != order {
                    return Err(Error::CorruptIndex(format!(
                        "{}-gram record with {} tokens: `{}`",
                        order,
                        tokens.len(),
                        tokens.join(" ")
                    ))
                    .into());
                }
                ids.clear();
                for token in &tokens {
                    ids.push(index.vocab().id(token).ok_or_else(|| {
                        Error::VocabMiss(format!(
                            "`{}` in {}-gram `{}`",
                            token,
                            order,
                            tokens.join(" ")
                        ))
                    })?);
                }
                if ids[..order - 1] != prefix[..] {
                    dispatch(&prefix, &mut words)?;
                    prefix.clear();
                    prefix.extend_from_slice(&ids[..order - 1]);
                }
                words.push((ids[order - 1], count));
                pl.light_update();
            }
            dispatch(&prefix, &mut words)?;
            drop(dispatch);
            drop(senders);

            let mut indexers = Vec::with_capacity(num_shards);
            for handle in handles {
                indexers.push(handle.join().expect("reducer panicked")?);
            }
            Ok(indexers)
        })?;

        // Seal the order shard by shard.
        for (shard, indexer) in appended.into_iter().enumerate() {
            let added = indexer.finish(index.shard_mut(shard));
            count_values[shard].extend(added);
        }
        index.set_order(order);
        pl.done();
    }

    Ok(NGramCounts {
        index,
        counts: count_values
            .into_iter()
            .map(CountShard::from_values)
            .collect(),
        types: Vec::new(),
    })
}
