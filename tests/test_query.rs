/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

mod common;

use anyhow::Result;
use common::*;
use ngramix::error::Error;
use ngramix::temp::TempRoot;
use ngramix::vocab::{BOS, EOS, UNK};
use ngramix::{logprob_bos, Id};

fn ids(model: &ngramix::model::NGramModel, sentence: &str) -> Vec<Id> {
    sentence
        .split_whitespace()
        .map(|w| model.index.vocab().id_or_unk(w))
        .collect()
}

/// Scoring a sentence on the forward model and on its reorganisation
/// agrees.
#[test]
fn test_backward_equivalence() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("query-bw-").tempdir()?;
    let forward = corpus_model(dir.path(), LARGER_CORPUS, 3, 4)?;
    let temp = TempRoot::new(Some(dir.path().to_owned()));
    let backward = forward.backward(&temp)?;
    assert!(backward.index.backward());

    for sentence in [
        "<s> the cat sat on the mat </s>",
        "<s> the dog ate the fish </s>",
        "<s> unseen words here </s>",
        "<s> a cat sat </s>",
        "the the the",
    ] {
        let sequence = ids(&forward, sentence);
        let (fwd, fwd_oov) = forward.score_sequence(&sequence)?;
        let (bwd, bwd_oov) = backward.score_sequence(&sequence)?;
        assert_eq!(fwd_oov, bwd_oov);
        assert!(
            (fwd - bwd).abs() < 1e-6,
            "{}: forward {} vs backward {}",
            sentence,
            fwd,
            bwd
        );
        assert!(fwd < 0.0);
    }
    Ok(())
}

/// Repeated application of `score` is bit-stable, and a state round-trips
/// through further extensions deterministically.
#[test]
fn test_query_idempotence() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("query-idem-").tempdir()?;
    let forward = corpus_model(dir.path(), LARGER_CORPUS, 3, 2)?;
    let temp = TempRoot::new(Some(dir.path().to_owned()));
    let model = forward.backward(&temp)?;

    let sequence = ids(&model, "<s> the cat sat on the mat </s>");
    let mut state = model.root();
    for &word in &sequence {
        let (next_a, logprob_a) = model.score(state, word)?;
        let (next_b, logprob_b) = model.score(state, word)?;
        assert_eq!(next_a, next_b);
        assert_eq!(logprob_a.to_bits(), logprob_b.to_bits());
        state = next_a;
    }
    Ok(())
}

/// `<s>` scored from the empty context gets the sentinel probability.
#[test]
fn test_bos_sentinel() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("query-bos-").tempdir()?;
    let forward = corpus_model(dir.path(), LARGER_CORPUS, 3, 2)?;
    let temp = TempRoot::new(Some(dir.path().to_owned()));
    let model = forward.backward(&temp)?;

    let (_, logprob) = model.score(model.root(), BOS)?;
    assert!((logprob - logprob_bos()).abs() < 1e-4);
    Ok(())
}

/// Unknown ids back off silently to the smoothing probability; the empty
/// sequence scores zero.
#[test]
fn test_unknown_and_empty() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("query-unk-").tempdir()?;
    let forward = corpus_model(dir.path(), LARGER_CORPUS, 3, 2)?;
    let temp = TempRoot::new(Some(dir.path().to_owned()));
    let model = forward.backward(&temp)?;

    let (state, logprob) = model.score(model.root(), 9999)?;
    assert!(state.is_root_node());
    assert!((logprob - model.smooth).abs() < 1e-6);

    let (unk_state, unk_logprob) = model.score(model.root(), UNK)?;
    assert!(!unk_state.is_root_node());
    assert!(unk_logprob < 0.0);

    assert_eq!(model.score_sequence(&[])?, (0.0, 0));
    let (_, oov) = model.score_sequence(&[UNK, EOS, 12345])?;
    assert_eq!(oov, 2);
    Ok(())
}

/// The same corpus estimated under different shard counts scores sentences
/// identically (up to float noise from the differing reduction orders).
#[test]
fn test_shard_count_invariance() -> Result<()> {
    let sentences = [
        "<s> the cat sat on the mat </s>",
        "<s> a dog and a cat </s>",
        "<s> the fish swam </s>",
    ];
    let mut reference: Option<Vec<f32>> = None;
    for shards in [1usize, 2, 4] {
        let dir = tempfile::Builder::new()
            .prefix(&format!("query-shards-{}-", shards))
            .tempdir()?;
        let forward = corpus_model(dir.path(), LARGER_CORPUS, 3, shards)?;
        let temp = TempRoot::new(Some(dir.path().to_owned()));
        let model = forward.backward(&temp)?;
        let scores: Vec<f32> = sentences
            .iter()
            .map(|s| Ok(model.score_sequence(&ids(&model, s))?.0))
            .collect::<Result<_>>()?;
        match &reference {
            None => reference = Some(scores),
            Some(reference) => {
                for (a, b) in reference.iter().zip(&scores) {
                    assert!((a - b).abs() < 1e-4, "{} vs {} under {} shards", a, b, shards);
                }
            }
        }
    }
    Ok(())
}

/// Concurrent readers over the same mapped model agree with the serial
/// scores.
#[test]
fn test_concurrent_scoring() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("query-mt-").tempdir()?;
    let forward = corpus_model(dir.path(), LARGER_CORPUS, 4, 4)?;
    let temp = TempRoot::new(Some(dir.path().to_owned()));
    let model = forward.backward(&temp)?;
    let repo = dir.path().join("model");
    model.write(&repo)?;
    let model = ngramix::model::NGramModel::open(&repo, Some(4))?;

    let sequence = ids(&model, "<s> the cat sat on the dog </s>");
    let (expected, _) = model.score_sequence(&sequence)?;
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let model = &model;
            let sequence = &sequence;
            scope.spawn(move || {
                for _ in 0..50 {
                    let (score, _) = model.score_sequence(sequence).unwrap();
                    assert_eq!(score.to_bits(), expected.to_bits());
                }
            });
        }
    });
    Ok(())
}

/// State queries demand backward storage.
#[test]
fn test_forward_state_query_is_rejected() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("query-fwd-").tempdir()?;
    let model = corpus_model(dir.path(), S1_CORPUS, 3, 2)?;
    let err = model.score(model.root(), BOS).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::CorruptIndex(_))
    ));
    Ok(())
}

/// Bounds never fall below the probability of any scored continuation.
#[test]
fn test_bound_dominates_score() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("query-bound-").tempdir()?;
    let forward = corpus_model(dir.path(), LARGER_CORPUS, 3, 2)?;
    let temp = TempRoot::new(Some(dir.path().to_owned()));
    let model = forward.backward(&temp)?;
    let vocab = model.index.vocab();

    let context = ids(&model, "<s> the");
    let mut state = model.root();
    for &word in &context {
        state = model.score(state, word)?.0;
    }
    for id in 0..vocab.len() as Id {
        let (_, bound) = model.bound(state, id)?;
        let (_, score) = model.score(state, id)?;
        assert!(
            bound >= score - 1e-4,
            "bound {} below score {} for `{}`",
            bound,
            score,
            vocab.word(id)
        );
    }
    Ok(())
}
