/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Typed error kinds surfaced at the driver API boundary.
//!
//! Most functions in this crate return [`anyhow::Result`] and attach path
//! context along the way; the kinds below are the root causes, so callers
//! can classify a failure with [`anyhow::Error::downcast_ref`].

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Open, read or write failed, or a required file is missing.
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A structural invariant of an on-disk repository is violated: a
    /// missing required key, non-monotonic offsets, an unknown `type` tag.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// The block decompressor refused its input.
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    /// An ingested n-gram referenced a word unknown to the sealed
    /// vocabulary.
    #[error("unknown word after vocabulary sealing: {0}")]
    VocabMiss(String),

    /// An opened index has a different shard count than the caller asked
    /// for.
    #[error("shard count mismatch: expected {expected}, found {found}")]
    ShardMismatch { expected: usize, found: usize },

    /// Discount estimation was handed invalid inputs.
    #[error("numeric failure: {0}")]
    Numeric(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
