/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Forward → backward trie reorganisation.
//!
//! The serving format stores n-grams most-recent token first, so that a
//! scorer's state extends by a new word and shrinks by its oldest one. The
//! reorganiser walks the forward index order by order, spills
//! `(reversed ids, logprob, backoff, logbound)` tuples in sorted batches,
//! merges them and rebuilds the trie through the usual indexing path.

use super::{NGramModel, ShardData};
use crate::error::Error;
use crate::index::{NGramIndex, ShardIndexer};
use crate::temp::TempRoot;
use crate::{Id, LOGPROB_MIN};
use anyhow::{Context, Result};
use dary_heap::QuaternaryHeap;
use log::info;
use rayon::prelude::*;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

/// Tuples per sorted batch file.
const BATCH_TUPLES: usize = 1 << 20;

/// `(logprob, backoff, logbound)` of one n-gram.
pub(crate) type Values = [f32; 3];

/// Spills key-sorted tuple batches and merges them back.
pub(crate) struct TupleSpill {
    dir: PathBuf,
    order: usize,
    batch: Vec<(Vec<Id>, Values)>,
    files: Vec<PathBuf>,
}

impl TupleSpill {
    pub(crate) fn new(temp: &TempRoot, order: usize) -> Result<Self> {
        Ok(TupleSpill {
            dir: temp.directory("ngramix.backward")?,
            order,
            batch: Vec::new(),
            files: Vec::new(),
        })
    }

    pub(crate) fn push(&mut self, key: Vec<Id>, values: Values) -> Result<()> {
        debug_assert_eq!(key.len(), self.order);
        self.batch.push((key, values));
        if self.batch.len() >= BATCH_TUPLES {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.batch.par_sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let path = self.dir.join(format!("{:06x}", self.files.len()));
        let file = std::fs::File::create(&path)
            .map_err(|e| Error::io(&path, e))
            .with_context(|| format!("Cannot create batch {}", path.display()))?;
        let mut out = BufWriter::with_capacity(1 << 16, file);
        for (key, values) in self.batch.drain(..) {
            for id in key {
                out.write_all(&id.to_le_bytes())?;
            }
            for value in values {
                out.write_all(&value.to_le_bytes())?;
            }
        }
        out.into_inner()
            .map_err(|e| anyhow::anyhow!("Cannot flush batch {}: {}", path.display(), e))?
            .sync_all()
            .map_err(|e| Error::io(&path, e))?;
        self.files.push(path);
        Ok(())
    }

    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn merge(mut self) -> Result<TupleMerge> {
        self.flush()?;
        let mut heap = QuaternaryHeap::with_capacity(self.files.len());
        for path in &self.files {
            let mut stream = TupleStream {
                reader: BufReader::with_capacity(
                    1 << 16,
                    std::fs::File::open(path).map_err(|e| Error::io(path, e))?,
                ),
                order: self.order,
            };
            if let Some(head) = stream.next_tuple()? {
                heap.push(TupleHead {
                    head,
                    tail: stream,
                });
            }
        }
        Ok(TupleMerge { heap })
    }
}

struct TupleStream {
    reader: BufReader<std::fs::File>,
    order: usize,
}

impl TupleStream {
    fn next_tuple(&mut self) -> Result<Option<(Vec<Id>, Values)>> {
        let mut buf = vec![0u8; self.order * 4 + 12];
        match self.reader.read_exact(&mut buf) {
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }
        let key = buf[..self.order * 4]
            .chunks_exact(4)
            .map(|c| Id::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let mut values = [0.0f32; 3];
        for (v, c) in values
            .iter_mut()
            .zip(buf[self.order * 4..].chunks_exact(4))
        {
            *v = f32::from_le_bytes(c.try_into().unwrap());
        }
        Ok(Some((key, values)))
    }
}

struct TupleHead {
    head: (Vec<Id>, Values),
    tail: TupleStream,
}

impl PartialEq for TupleHead {
    fn eq(&self, other: &Self) -> bool {
        self.head.0 == other.head.0
    }
}

impl Eq for TupleHead {}

impl PartialOrd for TupleHead {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TupleHead {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.head.0.cmp(&self.head.0)
    }
}

struct TupleMerge {
    heap: QuaternaryHeap<TupleHead>,
}

impl Iterator for TupleMerge {
    type Item = Result<(Vec<Id>, Values)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut top = self.heap.pop()?;
        let next = match top.tail.next_tuple() {
            Err(e) => return Some(Err(e)),
            Ok(next) => next,
        };
        let head = std::mem::replace(&mut top.head, (Vec::new(), [0.0; 3]));
        if let Some(head) = next {
            top.head = head;
            self.heap.push(top);
        }
        Some(Ok(head))
    }
}

/// Routes the merged, sorted tuples of one order into per-shard
/// indexers of a partially built index.
pub(crate) fn route_order(
    new_index: &NGramIndex,
    order: usize,
    spill: TupleSpill,
) -> Result<Vec<ShardIndexer<Values>>> {
    let num_shards = new_index.num_shards();
    type Group = (Vec<Id>, Vec<(Id, Values)>);
    std::thread::scope(|scope| -> Result<Vec<ShardIndexer<Values>>> {
        let mut senders = Vec::with_capacity(num_shards);
        let mut handles = Vec::with_capacity(num_shards);
        for shard in 0..num_shards {
            let (tx, rx) = crossbeam_channel::bounded::<Group>(65536);
            senders.push(tx);
            let trie = new_index.shard(shard);
            handles.push(scope.spawn(move || -> Result<ShardIndexer<Values>> {
                let mut indexer = ShardIndexer::new(trie);
                for (prefix, mut words) in rx {
                    indexer.append(trie, &prefix, &mut words)?;
                }
                Ok(indexer)
            }));
        }

        let mut dispatch = |prefix: &[Id], words: &mut Vec<(Id, Values)>| -> Result<()> {
            if words.is_empty() {
                return Ok(());
            }
            if order == 2 {
                let mut per_shard: Vec<Vec<(Id, Values)>> = vec![Vec::new(); num_shards];
                for &(word, values) in words.iter() {
                    per_shard[new_index.shard_index(&[prefix[0], word])].push((word, values));
                }
                for (shard, run) in per_shard.into_iter().enumerate() {
                    if !run.is_empty() {
                        senders[shard]
                            .send((prefix.to_vec(), run))
                            .map_err(|_| anyhow::anyhow!("indexer {} hung up", shard))?;
                    }
                }
                words.clear();
            } else {
                let shard = new_index.shard_index(prefix);
                senders[shard]
                    .send((prefix.to_vec(), std::mem::take(words)))
                    .map_err(|_| anyhow::anyhow!("indexer {} hung up", shard))?;
            }
            Ok(())
        };

        let mut prefix: Vec<Id> = Vec::new();
        let mut words: Vec<(Id, Values)> = Vec::new();
        for tuple in spill.merge()? {
            let (ids, values) = tuple?;
            if ids[..order - 1] != prefix[..] {
                dispatch(&prefix, &mut words)?;
                prefix.clear();
                prefix.extend_from_slice(&ids[..order - 1]);
            }
            words.push((ids[order - 1], values));
        }
        dispatch(&prefix, &mut words)?;
        drop(dispatch);
        drop(senders);

        let mut indexers = Vec::with_capacity(num_shards);
        for handle in handles {
            indexers.push(handle.join().expect("indexer panicked")?);
        }
        Ok(indexers)
    })
}

impl NGramModel {
    /// Rebuilds the model with reversed storage. A backward model is
    /// returned unchanged.
    pub fn backward(&self, temp: &TempRoot) -> Result<NGramModel> {
        if self.index.backward() {
            return Ok(self.clone());
        }
        let index = &self.index;
        let num_shards = index.num_shards();
        let max_order = index.order();
        let unigrams = index.unigrams();
        let has_bounds = self.has_bounds();

        let mut new_index = NGramIndex::with_unigrams(index.vocab().clone(), num_shards, true);

        // Unigram sections: values live in shard 0, the rest is padding.
        let mut logprob_values: Vec<Vec<f32>> = Vec::with_capacity(num_shards);
        let mut backoff_values: Vec<Vec<f32>> = Vec::with_capacity(num_shards);
        let mut logbound_values: Vec<Vec<f32>> = Vec::with_capacity(num_shards);
        for shard in 0..num_shards {
            if shard == 0 {
                let mut logprob = Vec::with_capacity(unigrams);
                let mut backoff = Vec::with_capacity(unigrams);
                let mut logbound = Vec::with_capacity(unigrams);
                for pos in 0..unigrams {
                    logprob.push(self.logprob_at(0, pos, 1)?);
                    backoff.push(if pos < self.backoffs[0].len() {
                        self.backoff_at(0, pos, 1)?
                    } else {
                        0.0
                    });
                    logbound.push(if has_bounds && pos < self.logbounds[0].len() {
                        self.logbound_at(0, pos, 1)?
                    } else {
                        LOGPROB_MIN
                    });
                }
                logprob_values.push(logprob);
                backoff_values.push(backoff);
                logbound_values.push(logbound);
            } else {
                logprob_values.push(vec![LOGPROB_MIN; unigrams]);
                backoff_values.push(vec![0.0; unigrams]);
                logbound_values.push(vec![LOGPROB_MIN; unigrams]);
            }
        }

        let mut key = Vec::new();
        for order in 2..=max_order {
            info!("reorganising {}-grams", order);
            let mut spill = TupleSpill::new(temp, order)?;
            for shard in 0..num_shards {
                let trie = index.shard(shard);
                for pos in trie.offsets[order - 1]..trie.offsets[order] {
                    trie.path_ids(pos, &mut key);
                    key.reverse();
                    let logprob = self.logprob_at(shard, pos, order)?;
                    let backoff = if pos < trie.position_size() {
                        self.backoff_at(shard, pos, order)?
                    } else {
                        0.0
                    };
                    let logbound = if has_bounds && pos < self.logbounds[shard].len() {
                        self.logbounds[shard].get(pos, order)?
                    } else {
                        LOGPROB_MIN
                    };
                    spill.push(std::mem::take(&mut key), [logprob, backoff, logbound])?;
                }
            }

            let spill_dir = spill.dir.clone();
            let added = route_order(&new_index, order, spill)?;
            for (shard, indexer) in added.into_iter().enumerate() {
                let sealed = indexer.finish(new_index.shard_mut(shard));
                for [logprob, backoff, logbound] in &sealed {
                    logprob_values[shard].push(*logprob);
                    if order < max_order {
                        backoff_values[shard].push(*backoff);
                        logbound_values[shard].push(*logbound);
                    }
                }
            }
            new_index.set_order(order);
            temp.remove(&spill_dir)?;
        }

        Ok(NGramModel {
            index: new_index,
            logprobs: logprob_values
                .into_iter()
                .map(|values| ShardData::from_vec(values, 0))
                .collect(),
            backoffs: backoff_values
                .into_iter()
                .map(|values| ShardData::from_vec(values, 0))
                .collect(),
            logbounds: if has_bounds {
                logbound_values
                    .into_iter()
                    .map(|values| ShardData::from_vec(values, 0))
                    .collect()
            } else {
                Vec::new()
            },
            smooth: self.smooth,
        })
    }

}
