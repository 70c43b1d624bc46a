/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! ARPA import and export.
//!
//! ARPA carries base-10 logs; everything internal is natural, so values
//! are scaled by ln 10 on the way in and back on the way out. Import
//! builds the vocabulary from the unigram section, then routes higher
//! orders through the sharded indexing path, producing a forward model
//! (reorganise it before serving). Export reverses backward storage back
//! to forward order.

use super::{route_order, NGramModel, ShardData, TupleSpill};
use crate::error::Error;
use crate::index::NGramIndex;
use crate::temp::TempRoot;
use crate::vocab::{VocabularyBuilder, UNK};
use crate::{Id, LOGPROB_MIN};
use anyhow::{Context, Result};
use log::info;
use std::io::{BufRead, Write};

const LN_10: f64 = std::f64::consts::LN_10;

fn parse_ngram_line(line: &str, order: usize) -> Result<(f64, Vec<&str>, f64)> {
    let mut fields = line.split_whitespace();
    let logprob: f64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::CorruptIndex(format!("malformed ARPA line `{}`", line)))?;
    let mut words = Vec::with_capacity(order);
    for _ in 0..order {
        words.push(fields.next().ok_or_else(|| {
            Error::CorruptIndex(format!("short ARPA {}-gram line `{}`", order, line))
        })?);
    }
    let backoff = match fields.next() {
        None => 0.0,
        Some(field) => field.parse().map_err(|_| {
            Error::CorruptIndex(format!("malformed ARPA back-off in `{}`", line))
        })?,
    };
    if fields.next().is_some() {
        return Err(Error::CorruptIndex(format!("overlong ARPA line `{}`", line)).into());
    }
    Ok((logprob, words, backoff))
}

/// Loads an ARPA model into a forward sharded model.
pub fn from_arpa(
    reader: impl BufRead,
    num_shards: usize,
    temp: &TempRoot,
) -> Result<NGramModel> {
    anyhow::ensure!(num_shards > 0, "at least one shard is required");
    let mut lines = reader.lines();

    // Header.
    loop {
        let line = lines
            .next()
            .ok_or_else(|| Error::CorruptIndex("ARPA input has no \\data\\ header".into()))?
            .context("Cannot read ARPA input")?;
        if line.trim() == "\\data\\" {
            break;
        }
    }
    let mut declared: Vec<u64> = Vec::new();
    let mut pending_section: Option<usize> = None;
    for line in lines.by_ref() {
        let line = line.context("Cannot read ARPA input")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("ngram ") {
            let (order, count) = rest.split_once('=').ok_or_else(|| {
                Error::CorruptIndex(format!("malformed ARPA count line `{}`", line))
            })?;
            let order: usize = order.trim().parse().map_err(|_| {
                Error::CorruptIndex(format!("malformed ARPA order in `{}`", line))
            })?;
            if order != declared.len() + 1 {
                return Err(Error::CorruptIndex(format!(
                    "ARPA orders must be contiguous; unexpected `{}`",
                    line
                ))
                .into());
            }
            declared.push(count.trim().parse().map_err(|_| {
                Error::CorruptIndex(format!("malformed ARPA count in `{}`", line))
            })?);
        } else if line == "\\1-grams:" {
            pending_section = Some(1);
            break;
        } else {
            return Err(
                Error::CorruptIndex(format!("unexpected ARPA header line `{}`", line)).into()
            );
        }
    }
    let max_order = declared.len();
    if max_order == 0 || pending_section != Some(1) {
        return Err(Error::CorruptIndex("ARPA input declares no orders".into()).into());
    }

    // Unigram section: the vocabulary plus its values.
    let mut builder = VocabularyBuilder::new();
    let mut logprob1: Vec<f32> = vec![LOGPROB_MIN; builder.len()];
    let mut backoff1: Vec<f32> = vec![0.0; builder.len()];
    let mut seen = 0u64;
    let mut next_section: Option<usize> = None;
    for line in lines.by_ref() {
        let line = line.context("Cannot read ARPA input")?;
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }
        if let Some(order) = parse_section_marker(&line) {
            next_section = Some(order);
            break;
        }
        if line == "\\end\\" {
            next_section = None;
            break;
        }
        let (logprob, words, backoff) = parse_ngram_line(&line, 1)?;
        let id = builder.insert(words[0]) as usize;
        if id >= logprob1.len() {
            logprob1.resize(id + 1, LOGPROB_MIN);
            backoff1.resize(id + 1, 0.0);
        }
        logprob1[id] = (logprob * LN_10) as f32;
        backoff1[id] = (backoff * LN_10) as f32;
        seen += 1;
    }
    if seen != declared[0] {
        return Err(Error::CorruptIndex(format!(
            "ARPA declares {} unigrams, found {}",
            declared[0], seen
        ))
        .into());
    }

    let vocab = builder.build();
    let unigrams = vocab.len();
    logprob1.resize(unigrams, LOGPROB_MIN);
    backoff1.resize(unigrams, 0.0);

    // A missing <unk> is synthesised as the uniform event.
    let smooth = if logprob1[UNK as usize] != LOGPROB_MIN {
        logprob1[UNK as usize]
    } else {
        let smooth = (1.0 / unigrams as f64).ln() as f32;
        logprob1[UNK as usize] = smooth;
        smooth
    };
    info!("ARPA vocabulary: {} words", unigrams);

    let mut index = NGramIndex::with_unigrams(vocab, num_shards, false);
    let mut logprob_values: Vec<Vec<f32>> = (0..num_shards)
        .map(|shard| {
            if shard == 0 {
                logprob1.clone()
            } else {
                vec![LOGPROB_MIN; unigrams]
            }
        })
        .collect();
    let mut backoff_values: Vec<Vec<f32>> = (0..num_shards)
        .map(|shard| {
            if shard == 0 {
                backoff1.clone()
            } else {
                vec![0.0; unigrams]
            }
        })
        .collect();

    // Higher-order sections: spill, sort, route to the shards.
    let mut section = next_section;
    for order in 2..=max_order {
        if section != Some(order) {
            return Err(Error::CorruptIndex(format!(
                "ARPA section for {}-grams is missing",
                order
            ))
            .into());
        }
        let mut spill = TupleSpill::new(temp, order)?;
        let mut seen = 0u64;
        section = None;
        for line in lines.by_ref() {
            let line = line.context("Cannot read ARPA input")?;
            let line = line.trim().to_owned();
            if line.is_empty() {
                continue;
            }
            if let Some(next) = parse_section_marker(&line) {
                section = Some(next);
                break;
            }
            if line == "\\end\\" {
                break;
            }
            let (logprob, words, backoff) = parse_ngram_line(&line, order)?;
            let mut ids = Vec::with_capacity(order);
            for word in &words {
                ids.push(index.vocab().id(word).ok_or_else(|| {
                    Error::VocabMiss(format!("`{}` in ARPA {}-gram `{}`", word, order, line))
                })?);
            }
            spill.push(
                ids,
                [(logprob * LN_10) as f32, (backoff * LN_10) as f32, LOGPROB_MIN],
            )?;
            seen += 1;
        }
        if seen != declared[order - 1] {
            return Err(Error::CorruptIndex(format!(
                "ARPA declares {} {}-grams, found {}",
                declared[order - 1],
                order,
                seen
            ))
            .into());
        }

        let spill_dir = spill.dir().to_owned();
        let added = route_order(&index, order, spill)?;
        for (shard, indexer) in added.into_iter().enumerate() {
            let sealed = indexer.finish(index.shard_mut(shard));
            for [logprob, backoff, _] in &sealed {
                logprob_values[shard].push(*logprob);
                if order < max_order {
                    backoff_values[shard].push(*backoff);
                }
            }
        }
        index.set_order(order);
        temp.remove(&spill_dir)?;
    }

    Ok(NGramModel {
        index,
        logprobs: logprob_values
            .into_iter()
            .map(|values| ShardData::from_vec(values, 0))
            .collect(),
        backoffs: backoff_values
            .into_iter()
            .map(|values| ShardData::from_vec(values, 0))
            .collect(),
        logbounds: Vec::new(),
        smooth,
    })
}

fn parse_section_marker(line: &str) -> Option<usize> {
    line.strip_prefix('\\')
        .and_then(|rest| rest.strip_suffix("-grams:"))
        .and_then(|order| order.parse().ok())
}

impl NGramModel {
    /// Writes the model in ARPA format, forward token order, base-10 logs.
    pub fn to_arpa(&self, writer: impl Write) -> Result<()> {
        let mut out = std::io::BufWriter::new(writer);
        let index = &self.index;
        let max_order = index.order();
        let unigrams = index.unigrams();
        let backward = index.backward();

        writeln!(out, "\\data\\")?;
        writeln!(out, "ngram 1={}", unigrams)?;
        for order in 2..=max_order {
            // Nodes that carry neither a probability nor a back-off are
            // structural only and do not become ARPA lines.
            let mut count = 0usize;
            for shard in 0..index.num_shards() {
                let trie = index.shard(shard);
                for pos in trie.offsets[order - 1]..trie.offsets[order] {
                    let logprob = self.logprob_at(shard, pos, order)?;
                    let backoff = if pos < trie.position_size() {
                        self.backoff_at(shard, pos, order)?
                    } else {
                        0.0
                    };
                    if logprob != LOGPROB_MIN || backoff != 0.0 {
                        count += 1;
                    }
                }
            }
            writeln!(out, "ngram {}={}", order, count)?;
        }

        let mut path: Vec<Id> = Vec::new();
        for order in 1..=max_order {
            writeln!(out)?;
            writeln!(out, "\\{}-grams:", order)?;
            if order == 1 {
                for id in 0..unigrams {
                    let logprob = self.logprob_at(0, id, 1)?;
                    let backoff = if max_order > 1 && id < self.backoffs[0].len() {
                        self.backoff_at(0, id, 1)?
                    } else {
                        0.0
                    };
                    self.write_arpa_line(
                        &mut out,
                        logprob,
                        std::iter::once(id as Id),
                        backoff,
                        max_order > 1,
                    )?;
                }
                continue;
            }
            for shard in 0..index.num_shards() {
                let trie = index.shard(shard);
                for pos in trie.offsets[order - 1]..trie.offsets[order] {
                    let logprob = self.logprob_at(shard, pos, order)?;
                    let backoff = if pos < trie.position_size() {
                        self.backoff_at(shard, pos, order)?
                    } else {
                        0.0
                    };
                    if logprob == LOGPROB_MIN && backoff == 0.0 {
                        continue;
                    }
                    trie.path_ids(pos, &mut path);
                    if backward {
                        path.reverse();
                    }
                    self.write_arpa_line(
                        &mut out,
                        logprob,
                        path.iter().copied(),
                        backoff,
                        order < max_order,
                    )?;
                }
            }
        }
        writeln!(out)?;
        writeln!(out, "\\end\\")?;
        out.flush()?;
        Ok(())
    }

    fn write_arpa_line(
        &self,
        out: &mut impl Write,
        logprob: f32,
        ids: impl Iterator<Item = Id>,
        backoff: f32,
        with_backoff: bool,
    ) -> Result<()> {
        // Absent probabilities on back-off-bearing nodes keep the SRILM
        // convention.
        let logprob10 = if logprob == LOGPROB_MIN {
            -99.0
        } else {
            logprob as f64 / LN_10
        };
        write!(out, "{}", logprob10)?;
        let vocab = self.index.vocab();
        for (i, id) in ids.enumerate() {
            out.write_all(if i == 0 { b"\t" } else { b" " })?;
            out.write_all(vocab.word(id).as_bytes())?;
        }
        if with_backoff && backoff != 0.0 {
            write!(out, "\t{}", backoff as f64 / LN_10)?;
        }
        writeln!(out)?;
        Ok(())
    }
}
