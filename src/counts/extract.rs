/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Corpus count accumulation.
//!
//! Sentences are bracketed with `<s>`…`</s>` and every k-gram up to the
//! requested order is counted in memory; when the estimated footprint
//! crosses the watermark the maps are spilled as sorted batches in the
//! Google n-gram layout. `finish` runs the postprocess step: per-order
//! `.idx` listings, the sorted `vocab.gz`, the count-descending
//! `vocab_cs.gz` and the `total` file.

use super::{CountFileWriter, GoogleCounts};
use crate::error::Error;
use crate::vocab::escape_word;
use anyhow::{Context, Result};
use dsi_progress_logger::*;
use log::info;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_WATERMARK: usize = 1 << 30;

/// Rough footprint of a fresh count-map entry.
const ENTRY_OVERHEAD: usize = 48;

pub struct CorpusExtractor {
    root: PathBuf,
    order: usize,
    watermark: usize,
    interner: HashMap<String, u32>,
    words: Vec<String>,
    /// One count map per order, 1-based.
    maps: Vec<HashMap<Box<[u32]>, u64>>,
    bytes: usize,
    /// `(file name, least n-gram)` of every spilled batch, per order.
    batches: Vec<Vec<(String, String)>>,
}

impl CorpusExtractor {
    /// Counts into the Google-layout tree rooted at `root`, spilling
    /// whenever roughly `watermark` bytes of counts are resident.
    pub fn new(root: impl AsRef<Path>, order: usize, watermark: usize) -> Result<Self> {
        anyhow::ensure!(order >= 1, "order must be at least 1");
        let root = root.as_ref().to_owned();
        for k in 1..=order {
            let dir = root.join(format!("{}gms", k));
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        Ok(CorpusExtractor {
            root,
            order,
            watermark,
            interner: HashMap::new(),
            words: Vec::new(),
            maps: vec![HashMap::new(); order + 1],
            bytes: 0,
            batches: vec![Vec::new(); order + 1],
        })
    }

    fn intern(&mut self, word: &str) -> u32 {
        let word = escape_word(word);
        if let Some(&id) = self.interner.get(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.words.push(word.to_owned());
        self.interner.insert(word.to_owned(), id);
        id
    }

    /// Counts one sentence (one line of the corpus, already tokenised by
    /// whitespace).
    pub fn push_line(&mut self, line: &str) -> Result<()> {
        let mut ids = Vec::with_capacity(line.len() / 4 + 2);
        ids.push(self.intern("<s>"));
        for token in line.split_whitespace() {
            ids.push(self.intern(token));
        }
        if ids.len() == 1 {
            return Ok(());
        }
        ids.push(self.intern("</s>"));

        for i in 0..ids.len() {
            for k in 1..=self.order.min(ids.len() - i) {
                let key = &ids[i..i + k];
                if let Some(count) = self.maps[k].get_mut(key) {
                    *count += 1;
                } else {
                    self.maps[k].insert(key.to_vec().into_boxed_slice(), 1);
                    self.bytes += k * 4 + ENTRY_OVERHEAD;
                }
            }
        }
        if self.bytes > self.watermark {
            self.spill()?;
        }
        Ok(())
    }

    /// Writes every non-empty map as one sorted batch per order.
    fn spill(&mut self) -> Result<()> {
        info!("spilling ~{} MiB of counts", self.bytes >> 20);
        for k in 1..=self.order {
            if self.maps[k].is_empty() {
                continue;
            }
            let mut entries: Vec<(Vec<&str>, u64)> = self.maps[k]
                .iter()
                .map(|(ids, &count)| {
                    (
                        ids.iter().map(|&id| self.words[id as usize].as_str()).collect(),
                        count,
                    )
                })
                .collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

            let name = format!("{}gm-{:06}.gz", k, self.batches[k].len());
            let path = self.root.join(format!("{}gms", k)).join(&name);
            let mut writer = CountFileWriter::create(&path)?;
            for (tokens, count) in &entries {
                writer.write(&tokens.join(" "), *count)?;
            }
            let first = writer.finish()?.unwrap_or_default();
            self.batches[k].push((name, first));
        }
        for map in &mut self.maps {
            map.clear();
        }
        self.bytes = 0;
        Ok(())
    }

    /// Final spill plus the postprocess outputs.
    pub fn finish(mut self) -> Result<GoogleCounts> {
        self.spill()?;

        for k in 1..=self.order {
            let idx = self
                .root
                .join(format!("{}gms", k))
                .join(format!("{}gm.idx", k));
            let mut listing = String::new();
            for (name, first) in &self.batches[k] {
                listing.push_str(name);
                listing.push('\t');
                listing.push_str(first);
                listing.push('\n');
            }
            std::fs::write(&idx, listing).map_err(|e| Error::io(&idx, e))?;
        }

        // The unigram postprocess: merged vocabularies and the total.
        let counts = GoogleCounts::open(&self.root)?;
        let mut vocabulary: Vec<(String, u64)> = Vec::new();
        let mut total = 0u64;
        for record in counts.iter_order(1)? {
            let (tokens, count) = record?;
            total += count;
            vocabulary.push((tokens.into_iter().next().unwrap_or_default(), count));
        }

        let vocab_path = self.root.join("1gms").join("vocab.gz");
        let mut writer = CountFileWriter::create(&vocab_path)?;
        for (word, count) in &vocabulary {
            writer.write(word, *count)?;
        }
        writer.finish()?;

        vocabulary.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let vocab_cs_path = self.root.join("1gms").join("vocab_cs.gz");
        let mut writer = CountFileWriter::create(&vocab_cs_path)?;
        for (word, count) in &vocabulary {
            writer.write(word, *count)?;
        }
        writer.finish()?;

        let total_path = self.root.join("1gms").join("total");
        let mut file =
            std::fs::File::create(&total_path).map_err(|e| Error::io(&total_path, e))?;
        writeln!(file, "{}", total).map_err(|e| Error::io(&total_path, e))?;
        file.sync_all().map_err(|e| Error::io(&total_path, e))?;

        GoogleCounts::open(&self.root)
    }
}

/// Counts a whole corpus (one sentence per line) into `root`.
pub fn extract_corpus(
    lines: impl Iterator<Item = std::io::Result<String>>,
    root: impl AsRef<Path>,
    order: usize,
    watermark: usize,
) -> Result<GoogleCounts> {
    let mut extractor = CorpusExtractor::new(root, order, watermark)?;
    let mut pl = ProgressLogger::default();
    pl.item_name("sentence").display_memory(true);
    pl.start("Counting...");
    for line in lines {
        extractor.push_line(&line.context("Cannot read corpus line")?)?;
        pl.light_update();
    }
    pl.done();
    extractor.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tokens: &[&str], count: u64) -> (Vec<String>, u64) {
        (tokens.iter().map(|s| s.to_string()).collect(), count)
    }

    #[test]
    fn test_small_corpus_counts() -> Result<()> {
        let dir = tempfile::Builder::new().prefix("extract-").tempdir()?;
        let mut extractor = CorpusExtractor::new(dir.path(), 3, DEFAULT_WATERMARK)?;
        extractor.push_line("a b c")?;
        extractor.push_line("a b")?;
        let counts = extractor.finish()?;

        let unigrams: Vec<_> = counts.iter_order(1)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(
            unigrams,
            vec![
                record(&["</s>"], 2),
                record(&["<s>"], 2),
                record(&["a"], 2),
                record(&["b"], 2),
                record(&["c"], 1),
            ]
        );

        let bigrams: Vec<_> = counts.iter_order(2)?.collect::<Result<Vec<_>>>()?;
        assert!(bigrams.contains(&record(&["a", "b"], 2)));
        assert!(bigrams.contains(&record(&["b", "c"], 1)));
        assert!(bigrams.contains(&record(&["<s>", "a"], 2)));
        assert!(bigrams.contains(&record(&["b", "</s>"], 1)));

        let trigrams: Vec<_> = counts.iter_order(3)?.collect::<Result<Vec<_>>>()?;
        assert!(trigrams.contains(&record(&["<s>", "a", "b"], 2)));
        assert!(trigrams.contains(&record(&["a", "b", "c"], 1)));
        assert!(trigrams.contains(&record(&["a", "b", "</s>"], 1)));

        // The postprocess artifacts.
        assert!(dir.path().join("1gms/vocab.gz").is_file());
        assert!(dir.path().join("1gms/vocab_cs.gz").is_file());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("1gms/total"))?.trim(),
            "9"
        );
        Ok(())
    }

    #[test]
    fn test_spills_merge_back() -> Result<()> {
        let dir = tempfile::Builder::new().prefix("extract-spill-").tempdir()?;
        // A watermark of zero forces a spill after every sentence.
        let mut extractor = CorpusExtractor::new(dir.path(), 2, 0)?;
        extractor.push_line("x y")?;
        extractor.push_line("x y")?;
        extractor.push_line("x z")?;
        let counts = extractor.finish()?;

        let bigrams: Vec<_> = counts.iter_order(2)?.collect::<Result<Vec<_>>>()?;
        assert!(bigrams.contains(&record(&["x", "y"], 2)));
        assert!(bigrams.contains(&record(&["x", "z"], 1)));

        // Three spills of order 1 listed in the idx.
        let idx = std::fs::read_to_string(dir.path().join("1gms/1gm.idx"))?;
        assert_eq!(idx.lines().count(), 3);
        Ok(())
    }

    #[test]
    fn test_empty_lines_are_skipped() -> Result<()> {
        let dir = tempfile::Builder::new().prefix("extract-e-").tempdir()?;
        let mut extractor = CorpusExtractor::new(dir.path(), 2, DEFAULT_WATERMARK)?;
        extractor.push_line("")?;
        extractor.push_line("   ")?;
        extractor.push_line("w")?;
        let counts = extractor.finish()?;
        let unigrams: Vec<_> = counts.iter_order(1)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(
            unigrams,
            vec![record(&["</s>"], 1), record(&["<s>"], 1), record(&["w"], 1),]
        );
        Ok(())
    }
}
