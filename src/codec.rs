/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Pluggable block compressors.
//!
//! A codec is a value type: cloning one yields an independent instance with
//! its own scratch state, so each cache slot can own a codec without
//! synchronization. The codec name is part of the on-disk `type` tag of
//! compressed block storage (`<name>-block`).

use crate::error::Error;
use anyhow::Result;
use std::io::Read;

pub trait BlockCodec: Send {
    /// The name used in the on-disk `type` tag.
    fn name(&self) -> &'static str;

    /// Compresses `src` into `dst` (cleared first). Deterministic for a
    /// given input.
    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;

    /// Decompresses `src` into `dst` (cleared first). Must round-trip any
    /// [`compress`](BlockCodec::compress) output; anything else fails with
    /// [`Error::CorruptBlock`].
    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;

    fn boxed_clone(&self) -> Box<dyn BlockCodec>;
}

impl Clone for Box<dyn BlockCodec> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// DEFLATE, the default block codec.
#[derive(Debug, Clone, Default)]
pub struct Deflate;

impl BlockCodec for Deflate {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        dst.clear();
        let mut encoder = flate2::read::DeflateEncoder::new(src, flate2::Compression::default());
        encoder.read_to_end(dst)?;
        Ok(())
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        dst.clear();
        let mut decoder = flate2::read::DeflateDecoder::new(src);
        decoder
            .read_to_end(dst)
            .map_err(|e| Error::CorruptBlock(format!("deflate: {}", e)))?;
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn BlockCodec> {
        Box::new(self.clone())
    }
}

/// Resolves an on-disk `type` tag (`<codec>-block`) to a codec instance.
pub fn codec_for(type_tag: &str) -> Result<Box<dyn BlockCodec>> {
    match type_tag.strip_suffix("-block") {
        Some("deflate") => Ok(Box::new(Deflate)),
        _ => Err(Error::CorruptIndex(format!("unknown storage type `{}`", type_tag)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() -> Result<()> {
        let mut codec = Deflate;
        let src: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let mut compressed = Vec::new();
        codec.compress(&src, &mut compressed)?;
        assert!(compressed.len() < src.len());
        let mut out = Vec::new();
        codec.decompress(&compressed, &mut out)?;
        assert_eq!(src, out);
        Ok(())
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let mut codec = Deflate;
        let mut out = Vec::new();
        let err = codec
            .decompress(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01], &mut out)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CorruptBlock(_))
        ));
    }

    #[test]
    fn test_tag_lookup() {
        assert_eq!(codec_for("deflate-block").unwrap().name(), "deflate");
        assert!(codec_for("quicklz-block").is_err());
    }
}
