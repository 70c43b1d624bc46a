/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

mod common;

use anyhow::Result;
use common::*;
use ngramix::vocab::{BOS, EOS, UNK};
use ngramix::{Id, LOGPROB_MIN, NONE};
use std::collections::HashMap;

/// The two-sentence corpus: raw counts, type counts and shard routing.
#[test]
fn test_s1_counts_and_types() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("pipeline-s1-").tempdir()?;
    let counts = corpus_counts(dir.path(), S1_CORPUS, 3, 4)?;
    let index = &counts.index;
    let vocab = index.vocab();

    let a = vocab.id("a").unwrap();
    let b = vocab.id("b").unwrap();
    let c = vocab.id("c").unwrap();

    // Unigram raw counts, replicated in shard 0.
    let unigram = |id: Id| counts.counts[0].get(id as usize);
    assert_eq!(unigram(BOS), 2);
    assert_eq!(unigram(EOS), 2);
    assert_eq!(unigram(UNK), 0);
    assert_eq!(unigram(a), 2);
    assert_eq!(unigram(b), 2);
    assert_eq!(unigram(c), 1);

    // Raw counts of selected n-grams, via their owning shard.
    let raw = |key: &[Id]| -> u64 {
        let shard = index.shard_index(key);
        let (matched, pos) = index.traverse(shard, key);
        assert_eq!(matched, key.len(), "missing n-gram {:?}", key);
        counts.counts[shard].get(pos)
    };
    assert_eq!(raw(&[a, b]), 2);
    assert_eq!(raw(&[BOS, a, b]), 2);
    assert_eq!(raw(&[a, b, c]), 1);

    // Modified (left-continuation) counts.
    let types = |key: &[Id]| -> u64 {
        let shard = index.shard_index(key);
        let (_, pos) = index.traverse(shard, key);
        counts.types[shard].get(pos)
    };
    assert_eq!(types(&[b]), 1);
    assert_eq!(types(&[c]), 1);
    assert_eq!(types(&[a]), 1);
    assert_eq!(types(&[EOS]), 2);
    // <s> keeps its raw count, and so do <s>-prefixed n-grams.
    assert_eq!(types(&[BOS]), 2);
    assert_eq!(types(&[BOS, a]), 2);
    // The highest order copies the raw counts.
    assert_eq!(types(&[a, b, c]), 1);
    assert_eq!(types(&[BOS, a, b]), 2);
    Ok(())
}

/// Every non-unigram node lies inside its parent's child range, with ids
/// sorted among siblings.
#[test]
fn test_trie_parent_child_consistency() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("pipeline-trie-").tempdir()?;
    let counts = corpus_counts(dir.path(), LARGER_CORPUS, 4, 3)?;
    for trie in counts.index.shards() {
        for pos in trie.offsets[1]..trie.size() {
            let parent = trie.parent(pos);
            assert_ne!(parent, NONE);
            assert!(parent < pos);
            assert!(trie.children_first(parent) <= pos);
            assert!(pos < trie.children_last(parent));
        }
        // Sibling ids strictly increase.
        for pos in 0..trie.position_size() {
            let first = trie.children_first(pos);
            let last = trie.children_last(pos);
            for child in first.max(1)..last {
                if child > first {
                    assert!(trie.index(child - 1) < trie.index(child));
                }
            }
        }
    }
    Ok(())
}

/// Concatenating all shards yields exactly the counted multiset, each
/// n-gram in the shard its routing hash names.
#[test]
fn test_shard_totality() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("pipeline-total-").tempdir()?;
    let google = corpus_layout(&dir.path().join("google"), LARGER_CORPUS, 3)?;
    let counts = {
        let mut counts = ngramix::counts::index_counts(&google, 3, 4)?;
        counts.modify()?;
        counts
    };
    let index = &counts.index;
    let vocab = index.vocab();

    for order in 2..=3 {
        // The reference multiset from the count files.
        let mut expected: HashMap<Vec<Id>, u64> = HashMap::new();
        for record in google.iter_order(order)? {
            let (tokens, count) = record?;
            let key: Vec<Id> = tokens.iter().map(|t| vocab.id(t).unwrap()).collect();
            expected.insert(key, count);
        }

        let mut found: HashMap<Vec<Id>, u64> = HashMap::new();
        for (shard, trie) in index.shards().iter().enumerate() {
            let mut key = Vec::new();
            for pos in trie.offsets[order - 1]..trie.offsets[order] {
                trie.path_ids(pos, &mut key);
                assert_eq!(index.shard_index(&key), shard, "misrouted {:?}", key);
                assert!(
                    found.insert(key.clone(), counts.counts[shard].get(pos)).is_none(),
                    "{:?} stored twice",
                    key
                );
            }
        }
        assert_eq!(found, expected, "order {}", order);
    }
    Ok(())
}

/// Unigram probabilities sum to one (the start symbol is not an event).
#[test]
fn test_unigram_probability_sum() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("pipeline-psum1-").tempdir()?;
    let model = corpus_model(dir.path(), LARGER_CORPUS, 3, 2)?;
    let unigrams = model.index.unigrams();
    let mut sum = 0.0f64;
    for id in 0..unigrams {
        if id == BOS as usize {
            continue;
        }
        let logprob = model.logprobs[0].get(id, 1)?;
        if logprob != LOGPROB_MIN {
            sum += (logprob as f64).exp();
        }
    }
    assert!((sum - 1.0).abs() < 1e-5, "unigram mass {}", sum);
    Ok(())
}

/// For every context, the discounted mass plus the back-off-scaled
/// lower-order remainder is one.
#[test]
fn test_context_probability_sum() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("pipeline-psum-").tempdir()?;
    let model = corpus_model(dir.path(), LARGER_CORPUS, 4, 3)?;
    let index = &model.index;

    let mut checked = 0;
    let mut check = |context: &[Id],
                     children: &[(usize, usize)],
                     alpha_shard: usize,
                     alpha_pos: usize|
     -> Result<()> {
        let mut sum_hi = 0.0f64;
        let mut sum_lo = 0.0f64;
        let mut any = false;
        let order = context.len();
        for &(shard, child) in children {
            let logprob = model.logprobs[shard].get(child, order + 1)?;
            if logprob == LOGPROB_MIN {
                continue;
            }
            any = true;
            sum_hi += (logprob as f64).exp();
            let mut suffix = context[1..].to_vec();
            suffix.push(index.shard(shard).index(child));
            sum_lo += (model.logprob_ngram(&suffix)? as f64).exp();
        }
        if !any || sum_lo >= 1.0 {
            return Ok(());
        }
        let alpha = (model.backoffs[alpha_shard].get(alpha_pos, order)? as f64).exp();
        let total = sum_hi + alpha * (1.0 - sum_lo);
        assert!(
            (total - 1.0).abs() < 1e-4,
            "context {:?}: {} + {}·(1−{}) = {}",
            context,
            sum_hi,
            alpha,
            sum_lo,
            total
        );
        checked += 1;
        Ok(())
    };

    // Unigram contexts: their children scatter over every shard and their
    // back-off lives in shard 0.
    for unigram in 0..index.unigrams() {
        let mut children = Vec::new();
        for (shard, trie) in index.shards().iter().enumerate() {
            for child in trie.children_first(unigram)..trie.children_last(unigram) {
                children.push((shard, child));
            }
        }
        if !children.is_empty() {
            check(&[unigram as Id], &children, 0, unigram)?;
        }
    }

    // Higher-order contexts are local to their shard.
    for (shard, trie) in index.shards().iter().enumerate() {
        let mut context = Vec::new();
        for order in 2..index.order() {
            for pos in trie.offsets[order - 1]..trie.offsets[order] {
                let first = trie.children_first(pos);
                let last = trie.children_last(pos);
                if first == last {
                    continue;
                }
                trie.path_ids(pos, &mut context);
                let children: Vec<(usize, usize)> =
                    (first..last).map(|child| (shard, child)).collect();
                check(&context, &children, shard, pos)?;
            }
        }
    }
    assert!(checked > 10, "only {} contexts checked", checked);
    Ok(())
}

/// Every stored bound dominates the log-probabilities of the extensions a
/// query can reach through it.
#[test]
fn test_logbound_dominates_extensions() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("pipeline-bound-").tempdir()?;
    let model = corpus_model(dir.path(), LARGER_CORPUS, 3, 2)?;
    let index = &model.index;
    let max_order = index.order();

    // Walk every highest-order n-gram and check its suffixes' bounds.
    for (shard, trie) in index.shards().iter().enumerate() {
        let mut key = Vec::new();
        for pos in trie.offsets[max_order - 1]..trie.offsets[max_order] {
            let logprob = model.logprobs[shard].get(pos, max_order)?;
            if logprob == LOGPROB_MIN {
                continue;
            }
            trie.path_ids(pos, &mut key);
            for start in 1..key.len() {
                let sub = &key[start..];
                let target = index.shard_index(sub);
                let (matched, sub_pos) = index.traverse(target, sub);
                assert_eq!(matched, sub.len());
                let bound_shard = if sub.len() == 1 { 0 } else { target };
                let bound = model.logbounds[bound_shard].get(sub_pos, sub.len())?;
                assert!(
                    bound >= logprob,
                    "bound {} of {:?} below logprob {} of {:?}",
                    bound,
                    sub,
                    logprob,
                    key
                );
            }
        }
    }
    Ok(())
}
