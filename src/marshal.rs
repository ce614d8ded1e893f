//! Artifact marshaling. A marshaler wraps the complete wire-form payload on
//! its way to disk and unwraps it on the way back; the read path must use
//! the same marshaler the write path used, since artifacts are not
//! self-describing.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::{Compress, Compression, Decompress};

use crate::wire::{self, SYNTHETIC_HEAD};

pub trait Marshaler: Send + Sync {
    /// Wraps the payload for storage, writing the artifact bytes to `out`.
    fn marshal(&self, out: &mut Vec<u8>, input: &[u8]) -> Result<()>;

    /// Unwraps artifact bytes back into the wire-form payload.
    fn unmarshal(&self, out: &mut Vec<u8>, input: &[u8]) -> Result<()>;
}

/// Gzip-compresses artifacts.
pub struct GzipMarshaler {
    level: Compression,
}

impl GzipMarshaler {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for GzipMarshaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Marshaler for GzipMarshaler {
    fn marshal(&self, out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(input)
            .context("failed to gzip-compress artifact")?;
        let compressed = encoder.finish().context("failed to finish gzip stream")?;
        out.extend_from_slice(&compressed);
        Ok(())
    }

    fn unmarshal(&self, out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
        let mut decoder = GzDecoder::new(input);
        decoder
            .read_to_end(out)
            .context("failed to gzip-decompress artifact")?;
        Ok(())
    }
}

/// Zlib-compresses artifacts, optionally with a preset dictionary shared
/// between the write and read sides.
pub struct ZlibMarshaler {
    level: Compression,
    dict: Option<Vec<u8>>,
}

impl ZlibMarshaler {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
            dict: None,
        }
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level),
            dict: None,
        }
    }

    pub fn with_dictionary(level: u32, dict: impl Into<Vec<u8>>) -> Self {
        Self {
            level: Compression::new(level),
            dict: Some(dict.into()),
        }
    }
}

impl Default for ZlibMarshaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Marshaler for ZlibMarshaler {
    fn marshal(&self, out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
        let mut encoder = match &self.dict {
            Some(dict) => {
                let mut compress = Compress::new(self.level, true);
                compress
                    .set_dictionary(dict)
                    .context("failed to set zlib compression dictionary")?;
                ZlibEncoder::new_with_compress(Vec::new(), compress)
            }
            None => ZlibEncoder::new(Vec::new(), self.level),
        };
        encoder
            .write_all(input)
            .context("failed to zlib-compress artifact")?;
        let compressed = encoder.finish().context("failed to finish zlib stream")?;
        out.extend_from_slice(&compressed);
        Ok(())
    }

    fn unmarshal(&self, out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
        let mut decoder = match &self.dict {
            Some(dict) => {
                let mut decompress = Decompress::new(true);
                decompress
                    .set_dictionary(dict)
                    .context("failed to set zlib decompression dictionary")?;
                ZlibDecoder::new_with_decompress(input, decompress)
            }
            None => ZlibDecoder::new(input),
        };
        decoder
            .read_to_end(out)
            .context("failed to zlib-decompress artifact")?;
        Ok(())
    }
}

/// Discards the response head at store time and synthesizes a minimal
/// `200 OK` head on load. Optionally chains the remaining body through a
/// second marshaler.
pub struct FlatMarshaler {
    chain: Option<Arc<dyn Marshaler>>,
}

impl FlatMarshaler {
    pub fn new() -> Self {
        Self { chain: None }
    }

    pub fn chained(chain: Arc<dyn Marshaler>) -> Self {
        Self { chain: Some(chain) }
    }
}

impl Default for FlatMarshaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Marshaler for FlatMarshaler {
    fn marshal(&self, out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
        let Some(offset) = wire::body_offset(input) else {
            bail!("unable to find header/body boundary");
        };
        let body = &input[offset..];
        match &self.chain {
            Some(chain) => chain.marshal(out, body),
            None => {
                out.extend_from_slice(body);
                Ok(())
            }
        }
    }

    fn unmarshal(&self, out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
        out.extend_from_slice(SYNTHETIC_HEAD);
        match &self.chain {
            Some(chain) => {
                let mut body = Vec::new();
                chain.unmarshal(&mut body, input)?;
                out.extend_from_slice(&body);
                Ok(())
            }
            None => {
                out.extend_from_slice(input);
                Ok(())
            }
        }
    }
}
