/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use ngramix::codec::Deflate;
use ngramix::error::Error;
use ngramix::storage::{BlockFile, BlockFileWriter, BLOCK_SIZE};
use std::path::Path;

fn write_storage(dir: &Path) -> Result<()> {
    let mut writer = BlockFileWriter::<u64>::create_compressed(dir, Box::new(Deflate))?;
    for i in 0..4 * (BLOCK_SIZE as u64 / 8) {
        writer.push(i % 1000)?;
    }
    writer.finish()?;
    Ok(())
}

/// Deleting the data file fails loudly, never with silent zero bytes.
#[test]
fn test_missing_data_is_io_error() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("blocks-data-").tempdir()?;
    let storage = dir.path().join("values");
    write_storage(&storage)?;
    std::fs::remove_file(storage.join("data"))?;

    let err = BlockFile::<u64>::open(&storage).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Io { .. })
    ));
    Ok(())
}

/// A surviving but truncated index is structural corruption.
#[test]
fn test_truncated_index_is_corrupt() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("blocks-index-").tempdir()?;
    let storage = dir.path().join("values");
    write_storage(&storage)?;
    let index = std::fs::read(storage.join("index"))?;
    std::fs::write(storage.join("index"), &index[..index.len() - 8])?;

    let err = BlockFile::<u64>::open(&storage).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::CorruptIndex(_))
    ));
    Ok(())
}

/// An unknown codec tag is structural corruption.
#[test]
fn test_unknown_type_tag_is_corrupt() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("blocks-type-").tempdir()?;
    let storage = dir.path().join("values");
    write_storage(&storage)?;
    std::fs::write(storage.join("type"), "quicklz-block")?;

    let err = BlockFile::<u64>::open(&storage).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::CorruptIndex(_))
    ));
    Ok(())
}

/// Scribbling over a compressed block surfaces as CorruptBlock on read.
#[test]
fn test_scribbled_block_is_corrupt() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("blocks-scribble-").tempdir()?;
    let storage = dir.path().join("values");
    write_storage(&storage)?;
    let mut data = std::fs::read(storage.join("data"))?;
    for byte in data.iter_mut().take(64) {
        *byte = !*byte;
    }
    std::fs::write(storage.join("data"), &data)?;

    let file = BlockFile::<u64>::open(&storage)?;
    let mut failed = false;
    for i in 0..file.len() {
        match file.get(i) {
            Err(e) => {
                assert!(matches!(
                    e.downcast_ref::<Error>(),
                    Some(Error::CorruptBlock(_))
                ));
                failed = true;
                break;
            }
            Ok(_) => continue,
        }
    }
    assert!(failed, "corruption went unnoticed");
    Ok(())
}
