/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Shared fixtures: tiny corpora pushed through the whole pipeline.

use anyhow::Result;
use ngramix::counts::{index_counts, CorpusExtractor, GoogleCounts, NGramCounts, DEFAULT_WATERMARK};
use ngramix::model::NGramModel;
use std::path::Path;

pub fn corpus_layout(dir: &Path, lines: &[&str], order: usize) -> Result<GoogleCounts> {
    let mut extractor = CorpusExtractor::new(dir, order, DEFAULT_WATERMARK)?;
    for line in lines {
        extractor.push_line(line)?;
    }
    extractor.finish()
}

/// Counts, indexes and modifies a corpus.
pub fn corpus_counts(
    dir: &Path,
    lines: &[&str],
    order: usize,
    shards: usize,
) -> Result<NGramCounts> {
    let google = corpus_layout(&dir.join("google"), lines, order)?;
    let mut counts = index_counts(&google, order, shards)?;
    counts.modify()?;
    Ok(counts)
}

/// The full estimation pipeline up to the forward model with bounds.
pub fn corpus_model(
    dir: &Path,
    lines: &[&str],
    order: usize,
    shards: usize,
) -> Result<NGramModel> {
    let counts = corpus_counts(dir, lines, order, shards)?;
    let mut model = counts.estimate(false)?;
    model.bounds()?;
    Ok(model)
}

pub const S1_CORPUS: &[&str] = &["a b c", "a b"];

pub const LARGER_CORPUS: &[&str] = &[
    "the cat sat on the mat",
    "the dog sat on the log",
    "the cat ate the fish",
    "a dog and a cat",
    "the fish swam",
    "a cat sat",
    "the dog ate",
    "the cat sat on the dog",
];
