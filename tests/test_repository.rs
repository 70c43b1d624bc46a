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
use ngramix::model::NGramModel;
use ngramix::temp::TempRoot;
use std::collections::BTreeMap;
use std::path::Path;

/// Every file of a repository tree, relative path → bytes.
fn tree_bytes(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![root.to_owned()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().display().to_string();
                files.insert(rel, std::fs::read(&path)?);
            }
        }
    }
    Ok(files)
}

/// Reading a repository and writing it again is byte-equivalent.
#[test]
fn test_repository_round_trip() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("repo-rt-").tempdir()?;
    let forward = corpus_model(dir.path(), LARGER_CORPUS, 3, 3)?;
    let temp = TempRoot::new(Some(dir.path().to_owned()));
    let model = forward.backward(&temp)?;

    let first = dir.path().join("first");
    model.write(&first)?;
    let reopened = NGramModel::open(&first, None)?;
    let second = dir.path().join("second");
    reopened.write(&second)?;

    let first_tree = tree_bytes(&first)?;
    let second_tree = tree_bytes(&second)?;
    assert_eq!(
        first_tree.keys().collect::<Vec<_>>(),
        second_tree.keys().collect::<Vec<_>>()
    );
    for (name, bytes) in &first_tree {
        assert_eq!(bytes, &second_tree[name], "{} differs", name);
    }
    Ok(())
}

/// The reopened model scores exactly like the in-memory one.
#[test]
fn test_reopened_scores_match() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("repo-score-").tempdir()?;
    let forward = corpus_model(dir.path(), LARGER_CORPUS, 3, 2)?;
    let temp = TempRoot::new(Some(dir.path().to_owned()));
    let model = forward.backward(&temp)?;
    let repo = dir.path().join("model");
    model.write(&repo)?;
    let reopened = NGramModel::open(&repo, None)?;
    assert!((reopened.smooth - model.smooth).abs() < 1e-7);

    let vocab = model.index.vocab();
    let sequence: Vec<_> = "<s> the cat sat on the mat </s>"
        .split_whitespace()
        .map(|w| vocab.id_or_unk(w))
        .collect();
    let (a, _) = model.score_sequence(&sequence)?;
    let (b, _) = reopened.score_sequence(&sequence)?;
    assert_eq!(a.to_bits(), b.to_bits());
    Ok(())
}

/// A caller-specified shard count is checked against the repository.
#[test]
fn test_shard_mismatch() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("repo-mismatch-").tempdir()?;
    let forward = corpus_model(dir.path(), S1_CORPUS, 2, 3)?;
    let repo = dir.path().join("model");
    forward.write(&repo)?;

    assert!(NGramModel::open(&repo, Some(3)).is_ok());
    let err = NGramModel::open(&repo, Some(8)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::ShardMismatch {
            expected: 8,
            found: 3
        })
    ));
    Ok(())
}

/// Counts repositories round-trip too.
#[test]
fn test_counts_repository_round_trip() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("repo-counts-").tempdir()?;
    let counts = corpus_counts(dir.path(), LARGER_CORPUS, 3, 2)?;
    let first = dir.path().join("first");
    counts.write(&first)?;
    let reopened = ngramix::counts::NGramCounts::open(&first, Some(2))?;
    assert!(reopened.has_types());
    let second = dir.path().join("second");
    reopened.write(&second)?;
    assert_eq!(tree_bytes(&first)?, tree_bytes(&second)?);

    // The reopened counts estimate to the same model.
    let a = counts.estimate(false)?;
    let b = reopened.estimate(false)?;
    let vocab = a.index.vocab();
    let sequence: Vec<_> = "<s> the cat sat </s>"
        .split_whitespace()
        .map(|w| vocab.id_or_unk(w))
        .collect();
    assert_eq!(
        a.score_sequence(&sequence)?.0.to_bits(),
        b.score_sequence(&sequence)?.0.to_bits()
    );
    Ok(())
}
