/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The persistent id ↔ string bijection.
//!
//! Ids `0..3` are reserved for `<s>`, `</s>` and `<unk>`; every other word
//! gets a dense id in insertion order. The store is a directory with the
//! concatenated UTF-8 bytes (`data`), a packed vector of end offsets
//! (`offset`) and a `prop.list` with the size, and round-trips
//! bit-identically.

use crate::error::Error;
use crate::properties::PropList;
use crate::storage::{MmapBackend, PackedVec};
use crate::Id;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const BOS: Id = 0;
pub const EOS: Id = 1;
pub const UNK: Id = 2;

pub const BOS_WORD: &str = "<s>";
pub const EOS_WORD: &str = "</s>";
pub const UNK_WORD: &str = "<unk>";

/// Normalises the spelling variants of the reserved tokens
/// (`<S>`, `</S>`, `<UNK>`, any case) to their canonical forms.
pub fn escape_word(word: &str) -> &str {
    if word.len() <= 6 && word.starts_with('<') && word.ends_with('>') {
        if word.eq_ignore_ascii_case(BOS_WORD) {
            return BOS_WORD;
        }
        if word.eq_ignore_ascii_case(EOS_WORD) {
            return EOS_WORD;
        }
        if word.eq_ignore_ascii_case(UNK_WORD) {
            return UNK_WORD;
        }
    }
    word
}

enum Data {
    Mem(Arc<String>),
    Map(MmapBackend<u8>),
}

impl Data {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Data::Mem(data) => data.as_bytes(),
            Data::Map(mmap) => mmap.as_ref(),
        }
    }
}

impl Clone for Data {
    fn clone(&self) -> Self {
        match self {
            Data::Mem(data) => Data::Mem(data.clone()),
            Data::Map(mmap) => Data::Map(mmap.clone()),
        }
    }
}

/// An immutable vocabulary; build one with [`VocabularyBuilder`].
#[derive(Clone)]
pub struct Vocabulary {
    data: Data,
    offsets: PackedVec<u64>,
    ids: Arc<HashMap<String, Id>>,
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("len", &self.len())
            .finish()
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        VocabularyBuilder::new().build()
    }
}

impl Vocabulary {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The string of an id. Panics on an out-of-range id.
    pub fn word(&self, id: Id) -> &str {
        let id = id as usize;
        let start = if id == 0 {
            0
        } else {
            self.offsets.get(id - 1) as usize
        };
        let end = self.offsets.get(id) as usize;
        std::str::from_utf8(&self.data.as_bytes()[start..end]).expect("vocabulary data is UTF-8")
    }

    /// The id of a word, after normalisation, if present.
    pub fn id(&self, word: &str) -> Option<Id> {
        self.ids.get(escape_word(word)).copied()
    }

    /// As [`id`](Vocabulary::id), mapping unknown words to `<unk>`.
    pub fn id_or_unk(&self, word: &str) -> Id {
        self.id(word).unwrap_or(UNK)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        (0..self.len()).map(move |id| self.word(id as Id))
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let props = PropList::load(dir)?;
        let size: usize = props.require("size")?;
        let offsets = PackedVec::<u64>::open(dir.join("offset"))
            .with_context(|| format!("Cannot open vocabulary offsets of {}", dir.display()))?;
        if offsets.len() != size {
            return Err(Error::CorruptIndex(format!(
                "vocabulary {} declares {} words but has {} offsets",
                dir.display(),
                size,
                offsets.len()
            ))
            .into());
        }
        let data = MmapBackend::<u8>::load(dir.join("data"))
            .with_context(|| format!("Cannot open vocabulary data of {}", dir.display()))?;
        if offsets.len() > 0 && offsets.get(offsets.len() - 1) as usize > data.len() {
            return Err(Error::CorruptIndex(format!(
                "vocabulary {} offsets point past the data",
                dir.display()
            ))
            .into());
        }

        let mut ids = HashMap::with_capacity(size);
        let bytes = data.as_ref();
        let mut start = 0usize;
        for id in 0..size {
            let end = offsets.get(id) as usize;
            let word = std::str::from_utf8(&bytes[start..end]).map_err(|_| {
                Error::CorruptIndex(format!(
                    "vocabulary {} has non-UTF-8 word at id {}",
                    dir.display(),
                    id
                ))
            })?;
            ids.insert(word.to_string(), id as Id);
            start = end;
        }

        Ok(Vocabulary {
            data: Data::Map(data),
            offsets,
            ids: Arc::new(ids),
        })
    }

    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;
        let data_path = dir.join("data");
        std::fs::write(&data_path, self.data.as_bytes()).map_err(|e| Error::io(&data_path, e))?;
        self.offsets.write(dir.join("offset"))?;
        let mut props = PropList::new();
        props.set("size", self.len());
        props.store(dir)
    }
}

/// Accumulates words; the reserved tokens are always present.
#[derive(Debug, Clone)]
pub struct VocabularyBuilder {
    data: String,
    offsets: Vec<u64>,
    ids: HashMap<String, Id>,
}

impl Default for VocabularyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VocabularyBuilder {
    pub fn new() -> Self {
        let mut builder = VocabularyBuilder {
            data: String::new(),
            offsets: Vec::new(),
            ids: HashMap::new(),
        };
        builder.insert(BOS_WORD);
        builder.insert(EOS_WORD);
        builder.insert(UNK_WORD);
        builder
    }

    /// Interns a word, returning its id.
    pub fn insert(&mut self, word: &str) -> Id {
        let word = escape_word(word);
        if let Some(&id) = self.ids.get(word) {
            return id;
        }
        let id = self.offsets.len() as Id;
        self.data.push_str(word);
        self.offsets.push(self.data.len() as u64);
        self.ids.insert(word.to_string(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn build(self) -> Vocabulary {
        Vocabulary {
            data: Data::Mem(Arc::new(self.data)),
            offsets: PackedVec::from_values(self.offsets),
            ids: Arc::new(self.ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_prefix() {
        let vocab = Vocabulary::default();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.id(BOS_WORD), Some(BOS));
        assert_eq!(vocab.id(EOS_WORD), Some(EOS));
        assert_eq!(vocab.id(UNK_WORD), Some(UNK));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_word("<S>"), "<s>");
        assert_eq!(escape_word("</S>"), "</s>");
        assert_eq!(escape_word("<UNK>"), "<unk>");
        assert_eq!(escape_word("<Unk>"), "<unk>");
        assert_eq!(escape_word("word"), "word");
        assert_eq!(escape_word("<other>"), "<other>");
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut builder = VocabularyBuilder::new();
        let a = builder.insert("alpha");
        let b = builder.insert("beta");
        assert_eq!(builder.insert("alpha"), a);
        let vocab = builder.build();
        assert_eq!(vocab.id("alpha"), Some(a));
        assert_eq!(vocab.id("beta"), Some(b));
        assert_eq!(vocab.word(a), "alpha");
        assert_eq!(vocab.id("gamma"), None);
        assert_eq!(vocab.id_or_unk("gamma"), UNK);
    }

    #[test]
    fn test_round_trip_bit_identical() -> Result<()> {
        let mut builder = VocabularyBuilder::new();
        for word in ["the", "quick", "brown", "fox", "ünïcödé"] {
            builder.insert(word);
        }
        let vocab = builder.build();

        let dir = tempfile::Builder::new().prefix("vocab-").tempdir()?;
        let first = dir.path().join("first");
        vocab.write(&first)?;

        let read = Vocabulary::open(&first)?;
        assert_eq!(read.len(), vocab.len());
        for id in 0..vocab.len() as Id {
            assert_eq!(read.word(id), vocab.word(id));
        }

        let second = dir.path().join("second");
        read.write(&second)?;
        assert_eq!(
            std::fs::read(first.join("data"))?,
            std::fs::read(second.join("data"))?
        );
        assert_eq!(
            std::fs::read(first.join("offset"))?,
            std::fs::read(second.join("offset"))?
        );
        Ok(())
    }
}
