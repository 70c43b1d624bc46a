/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Reading count repositories in the Google n-gram layout.
//!
//! A layout root holds `1gms/vocab.gz` plus `<k>gms/` directories whose
//! data files are listed by a `<k>gm.idx` (file name and lexicographically
//! least n-gram per line). Every data file is sorted by n-gram string;
//! [`GoogleCounts::iter_order`] merges them with a quaternary heap, summing
//! the counts of records that appear in more than one file.

use crate::error::Error;
use anyhow::{Context, Result};
use dary_heap::QuaternaryHeap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

pub type CountRecord = (Vec<String>, u64);

/// A handle on a Google-layout tree.
#[derive(Debug, Clone)]
pub struct GoogleCounts {
    root: PathBuf,
    order: usize,
}

impl GoogleCounts {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_owned();
        if !root.join("1gms").is_dir() {
            return Err(Error::io(
                root.join("1gms"),
                std::io::Error::new(std::io::ErrorKind::NotFound, "missing 1gms directory"),
            )
            .into());
        }
        let mut order = 1;
        while root.join(format!("{}gms", order + 1)).is_dir() {
            order += 1;
        }
        Ok(GoogleCounts { root, order })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The highest order present.
    pub fn order(&self) -> usize {
        self.order
    }

    /// The data files of an order: from the `.idx` listing when present,
    /// otherwise the conventional names.
    fn order_files(&self, order: usize) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(format!("{}gms", order));
        let idx = dir.join(format!("{}gm.idx", order));
        if idx.is_file() {
            let bytes = std::fs::read_to_string(&idx).map_err(|e| Error::io(&idx, e))?;
            let mut files = Vec::new();
            for line in bytes.lines() {
                let name = line.split('\t').next().unwrap_or("");
                if name.is_empty() {
                    return Err(Error::CorruptIndex(format!(
                        "empty file name in {}",
                        idx.display()
                    ))
                    .into());
                }
                files.push(dir.join(name));
            }
            return Ok(files);
        }
        if order == 1 {
            let vocab = dir.join("vocab.gz");
            if vocab.is_file() {
                return Ok(vec![vocab]);
            }
        }
        // Spilled batches before postprocessing.
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|e| Error::io(&dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&format!("{}gm-", order)) && n.ends_with(".gz"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(Error::io(
                dir,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no count files"),
            )
            .into());
        }
        Ok(files)
    }

    /// A merged, string-sorted, count-summed stream of one order.
    pub fn iter_order(&self, order: usize) -> Result<MergedCounts> {
        anyhow::ensure!(
            order >= 1 && order <= self.order,
            "order {} outside 1..={}",
            order,
            self.order
        );
        let mut streams = Vec::new();
        for path in self.order_files(order)? {
            streams.push(CountStream::open(&path)?);
        }
        MergedCounts::new(streams)
    }
}

/// One sorted `tokens\tcount` gzip file.
struct CountStream {
    lines: std::io::Lines<std::io::BufReader<flate2::read::MultiGzDecoder<std::fs::File>>>,
    path: PathBuf,
}

impl CountStream {
    fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::io(path, e))
            .with_context(|| format!("Cannot open count file {}", path.display()))?;
        Ok(CountStream {
            lines: std::io::BufReader::new(flate2::read::MultiGzDecoder::new(file)).lines(),
            path: path.to_owned(),
        })
    }

    fn next_record(&mut self) -> Option<Result<CountRecord>> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(Error::io(&self.path, e).into())),
            };
            if line.is_empty() {
                continue;
            }
            let Some((tokens, count)) = line.rsplit_once('\t') else {
                return Some(Err(Error::CorruptIndex(format!(
                    "malformed count line `{}` in {}",
                    line,
                    self.path.display()
                ))
                .into()));
            };
            let Ok(count) = count.trim().parse::<u64>() else {
                return Some(Err(Error::CorruptIndex(format!(
                    "malformed count `{}` in {}",
                    count,
                    self.path.display()
                ))
                .into()));
            };
            return Some(Ok((
                tokens.split_whitespace().map(str::to_owned).collect(),
                count,
            )));
        }
    }
}

struct HeadTail {
    head: CountRecord,
    tail: CountStream,
}

impl PartialEq for HeadTail {
    fn eq(&self, other: &Self) -> bool {
        self.head.0 == other.head.0
    }
}

impl Eq for HeadTail {}

impl PartialOrd for HeadTail {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadTail {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: the heap is a max-heap and we want the least key.
        other.head.0.cmp(&self.head.0)
    }
}

/// The k-way merge over an order's files.
pub struct MergedCounts {
    heap: QuaternaryHeap<HeadTail>,
}

impl MergedCounts {
    fn new(streams: Vec<CountStream>) -> Result<Self> {
        let mut heap = QuaternaryHeap::with_capacity(streams.len());
        for mut tail in streams {
            match tail.next_record() {
                None => {}
                Some(Err(e)) => return Err(e),
                Some(Ok(head)) => heap.push(HeadTail { head, tail }),
            }
        }
        Ok(MergedCounts { heap })
    }

    fn advance(&mut self, mut tail: CountStream) -> Result<()> {
        match tail.next_record() {
            None => Ok(()),
            Some(Err(e)) => Err(e),
            Some(Ok(head)) => {
                self.heap.push(HeadTail { head, tail });
                Ok(())
            }
        }
    }
}

impl Iterator for MergedCounts {
    type Item = Result<CountRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let top = self.heap.pop()?;
        let (key, mut count) = top.head;
        if let Err(e) = self.advance(top.tail) {
            return Some(Err(e));
        }
        // Sum duplicates of the same n-gram across files.
        while let Some(peek) = self.heap.peek() {
            if peek.head.0 != key {
                break;
            }
            let dup = self.heap.pop().unwrap();
            count += dup.head.1;
            if let Err(e) = self.advance(dup.tail) {
                return Some(Err(e));
            }
        }
        Some(Ok((key, count)))
    }
}

/// Writes one sorted gzip count file; records must arrive in order.
pub(crate) struct CountFileWriter {
    out: flate2::write::GzEncoder<std::io::BufWriter<std::fs::File>>,
    path: PathBuf,
    first: Option<String>,
}

impl CountFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = std::fs::File::create(path)
            .map_err(|e| Error::io(path, e))
            .with_context(|| format!("Cannot create count file {}", path.display()))?;
        Ok(CountFileWriter {
            out: flate2::write::GzEncoder::new(
                std::io::BufWriter::new(file),
                flate2::Compression::default(),
            ),
            path: path.to_owned(),
            first: None,
        })
    }

    pub fn write(&mut self, tokens: &str, count: u64) -> Result<()> {
        use std::io::Write;
        if self.first.is_none() {
            self.first = Some(tokens.to_owned());
        }
        writeln!(self.out, "{}\t{}", tokens, count).map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }

    /// Returns the lexicographically least n-gram written.
    pub fn finish(self) -> Result<Option<String>> {
        self.out
            .finish()
            .map_err(|e| Error::io(&self.path, e))?
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Cannot flush {}: {}", self.path.display(), e))?
            .sync_all()
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(self.first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_gz(path: &Path, lines: &[(&str, u64)]) -> Result<()> {
        let mut writer = CountFileWriter::create(path)?;
        for &(tokens, count) in lines {
            writer.write(tokens, count)?;
        }
        writer.finish()?;
        Ok(())
    }

    #[test]
    fn test_merge_sums_duplicates() -> Result<()> {
        let dir = tempfile::Builder::new().prefix("google-").tempdir()?;
        let gms = dir.path().join("1gms");
        std::fs::create_dir_all(&gms)?;
        write_gz(&gms.join("1gm-000000.gz"), &[("a", 1), ("c", 2)])?;
        write_gz(&gms.join("1gm-000001.gz"), &[("a", 3), ("b", 5)])?;

        let counts = GoogleCounts::open(dir.path())?;
        assert_eq!(counts.order(), 1);
        let records: Vec<CountRecord> =
            counts.iter_order(1)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(
            records,
            vec![
                (vec!["a".to_owned()], 4),
                (vec!["b".to_owned()], 5),
                (vec!["c".to_owned()], 2),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_idx_listing_wins() -> Result<()> {
        let dir = tempfile::Builder::new().prefix("google-idx-").tempdir()?;
        let gms = dir.path().join("1gms");
        let gms2 = dir.path().join("2gms");
        std::fs::create_dir_all(&gms)?;
        std::fs::create_dir_all(&gms2)?;
        write_gz(&gms.join("vocab.gz"), &[("a", 1)])?;
        write_gz(&gms2.join("2gm-000000.gz"), &[("a a", 1)])?;
        write_gz(&gms2.join("ignored.gz"), &[("z z", 9)])?;
        std::fs::write(gms2.join("2gm.idx"), "2gm-000000.gz\ta a\n")?;

        let counts = GoogleCounts::open(dir.path())?;
        assert_eq!(counts.order(), 2);
        let records: Vec<CountRecord> =
            counts.iter_order(2)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(records, vec![(vec!["a".to_owned(), "a".to_owned()], 1)]);
        Ok(())
    }

    #[test]
    fn test_missing_layout_is_io_error() {
        let dir = tempfile::Builder::new()
            .prefix("google-miss-")
            .tempdir()
            .unwrap();
        let err = GoogleCounts::open(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Io { .. })
        ));
    }
}
