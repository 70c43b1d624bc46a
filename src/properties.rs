/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The `prop.list` key-value file carried by every repository directory.

use crate::error::Error;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const PROP_LIST: &str = "prop.list";

/// A loaded `prop.list`, remembering where it came from so that error
/// messages can name the offending file.
///
/// Keys are kept sorted and written one `key=value` per line, so a stored
/// file is byte-identical across round trips; reading accepts full
/// Java-properties syntax.
#[derive(Debug, Clone, Default)]
pub struct PropList {
    path: PathBuf,
    map: BTreeMap<String, String>,
}

impl PropList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `dir/prop.list`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(PROP_LIST);
        let file = std::fs::File::open(&path)
            .map_err(|e| Error::io(&path, e))
            .with_context(|| format!("Cannot open {}", path.display()))?;
        let map = java_properties::read(BufReader::new(file))
            .map_err(|e| Error::CorruptIndex(format!("{}: {}", path.display(), e)))?
            .into_iter()
            .collect();
        Ok(PropList { path, map })
    }

    /// Writes `dir/prop.list`, fsyncing before returning so the metadata is
    /// durable before anything points at it.
    pub fn store(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(PROP_LIST);
        let mut contents = String::new();
        for (key, value) in &self.map {
            contents.push_str(key);
            contents.push('=');
            contents.push_str(value);
            contents.push('\n');
        }
        let mut file = std::fs::File::create(&path)
            .map_err(|e| Error::io(&path, e))
            .with_context(|| format!("Cannot create {}", path.display()))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| Error::io(&path, e))?;
        file.sync_all().map_err(|e| Error::io(&path, e))?;
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Returns the value of a required key, parsed, failing with
    /// [`Error::CorruptIndex`] if the key is absent or malformed.
    pub fn require<T: FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.map.get(key).ok_or_else(|| {
            Error::CorruptIndex(format!("missing key `{}` in {}", key, self.path.display()))
        })?;
        raw.parse().map_err(|_| {
            Error::CorruptIndex(format!(
                "malformed value `{}` for key `{}` in {}",
                raw,
                key,
                self.path.display()
            ))
            .into()
        })
    }

    /// As [`require`](PropList::require), with a default for absent keys.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.map.get(key) {
            None => Ok(default),
            Some(_) => self.require(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() -> Result<()> {
        let dir = tempfile::Builder::new().prefix("prop-").tempdir()?;
        let mut props = PropList::new();
        props.set("order", 5usize);
        props.set("backward", 1u8);
        props.store(dir.path())?;

        let read = PropList::load(dir.path())?;
        assert_eq!(read.require::<usize>("order")?, 5);
        assert_eq!(read.get_or::<u8>("backward", 0)?, 1);
        assert_eq!(read.get_or::<usize>("shard", 16)?, 16);
        assert!(read.require::<usize>("smooth").is_err());
        Ok(())
    }
}
