//! Payload decoding.

use std::{fmt, str::FromStr};

use async_compression::tokio::bufread::{GzipDecoder, ZlibDecoder};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use harbor_core::ingest::{DecodeError, Decoder};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt as _};

/// Content encodings understood by [`PayloadDecoder`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ContentEncoding {
    /// Not encoded.
    #[default]
    Identity,

    /// gzip, including multi-member streams.
    Gzip,

    /// zlib (HTTP `deflate`).
    Zlib,

    /// Standard base64, with padding.
    Base64,
}

impl ContentEncoding {
    /// Resolves an optional encoding hint, such as a `Content-Encoding` header or message attribute.
    ///
    /// A missing or empty hint means the payload is not encoded.
    ///
    /// # Errors
    ///
    /// If the hint names an unknown encoding, an error is returned.
    pub fn from_hint(hint: Option<&str>) -> Result<Self, DecodeError> {
        match hint {
            None => Ok(Self::Identity),
            Some(hint) => hint.parse(),
        }
    }

    /// Returns the canonical name of the encoding.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
            Self::Base64 => "base64",
        }
    }
}

impl FromStr for ContentEncoding {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "identity" | "none" => Ok(Self::Identity),
            "gzip" | "x-gzip" => Ok(Self::Gzip),
            "zlib" | "deflate" => Ok(Self::Zlib),
            "base64" => Ok(Self::Base64),
            _ => Err(DecodeError::UnsupportedEncoding { encoding: s.to_string() }),
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decodes identity, gzip, zlib, and base64 payloads.
///
/// Compressed payloads are decompressed incrementally, and decompression stops as soon as the output exceeds the
/// limit, so a small payload that inflates to something huge never gets fully materialized.
#[derive(Clone, Copy, Debug, Default)]
pub struct PayloadDecoder;

#[async_trait]
impl Decoder for PayloadDecoder {
    async fn decode(
        &self, payload: &[u8], encoding: Option<&str>, limit: Option<usize>,
    ) -> Result<Vec<u8>, DecodeError> {
        match ContentEncoding::from_hint(encoding)? {
            ContentEncoding::Identity => check_limit(payload.to_vec(), limit),
            ContentEncoding::Gzip => {
                let mut decoder = GzipDecoder::new(payload);
                decoder.multiple_members(true);
                read_limited(decoder, limit).await
            }
            ContentEncoding::Zlib => read_limited(ZlibDecoder::new(payload), limit).await,
            ContentEncoding::Base64 => {
                let decoded = STANDARD
                    .decode(payload.trim_ascii())
                    .map_err(|e| DecodeError::Malformed { source: e.into() })?;
                check_limit(decoded, limit)
            }
        }
    }
}

fn check_limit(decoded: Vec<u8>, limit: Option<usize>) -> Result<Vec<u8>, DecodeError> {
    match limit {
        Some(limit) if decoded.len() > limit => Err(DecodeError::TooLarge { limit }),
        _ => Ok(decoded),
    }
}

async fn read_limited<R>(reader: R, limit: Option<usize>) -> Result<Vec<u8>, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut decoded = Vec::new();
    let result = match limit {
        // Read one byte past the limit, which is enough to tell that the limit was exceeded.
        Some(limit) => {
            let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
            reader.take(cap).read_to_end(&mut decoded).await
        }
        None => {
            let mut reader = reader;
            reader.read_to_end(&mut decoded).await
        }
    };
    result.map_err(|e| DecodeError::Malformed { source: e.into() })?;

    check_limit(decoded, limit)
}
