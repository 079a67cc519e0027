//! Content fingerprints.
//!
//! A fingerprint is always 40 uppercase hex characters. Payloads of 20 bytes
//! or less are encoded verbatim (zero padded to 20 bytes); anything larger is
//! a SHA-1 over a fixed seed, the content, and the decimal content length.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{CasError, Result};

/// Seed prepended to every hashed payload.
const SEED: &[u8; 7] = b"mrCloud";

/// Content strictly shorter than this is encoded rather than hashed.
pub const SMALL_CONTENT_LIMIT: u64 = 21;

const DIGEST_LEN: usize = 20;

/// Length of the hex form of a fingerprint.
pub const FINGERPRINT_HEX_LEN: usize = DIGEST_LEN * 2;

/// Deterministic content identifier: dedup key and blob store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        if (data.len() as u64) < SMALL_CONTENT_LIMIT {
            let mut padded = [0u8; DIGEST_LEN];
            padded[..data.len()].copy_from_slice(data);
            return Self(hex::encode_upper(padded));
        }

        let mut hasher = Sha1::new();
        hasher.update(SEED);
        hasher.update(data);
        hasher.update(data.len().to_string().as_bytes());
        Self(hex::encode_upper(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Fingerprint {
    type Err = CasError;

    /// Accepts 40 hex characters in either case; the result is uppercase.
    fn from_str(s: &str) -> Result<Self> {
        if s.len() != FINGERPRINT_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CasError::InvalidFingerprint(s.to_string()));
        }
        Ok(Self(s.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = CasError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Incremental fingerprint for content too large to buffer.
///
/// The total size must be declared up front because it is part of the
/// digest. Small payloads cannot be streamed: their fingerprint is the
/// content itself.
pub struct StreamingHasher {
    inner: Sha1,
    declared: u64,
    seen: u64,
}

impl StreamingHasher {
    pub fn new(total_size: u64) -> Result<Self> {
        if total_size < SMALL_CONTENT_LIMIT {
            return Err(CasError::SmallContentStream { size: total_size });
        }
        let mut inner = Sha1::new();
        inner.update(SEED);
        Ok(Self {
            inner,
            declared: total_size,
            seen: 0,
        })
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.seen += chunk.len() as u64;
    }

    /// Finish the digest. Fails if the bytes fed differ from the declared size.
    pub fn finalize(mut self) -> Result<Fingerprint> {
        if self.seen != self.declared {
            return Err(CasError::SizeMismatch {
                declared: self.declared,
                actual: self.seen,
            });
        }
        self.inner.update(self.declared.to_string().as_bytes());
        Ok(Fingerprint(hex::encode_upper(self.inner.finalize())))
    }
}

impl Write for StreamingHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Fingerprint `size` bytes read from `reader`.
///
/// Small payloads are buffered; larger ones go through [`StreamingHasher`].
pub fn fingerprint_reader<R: Read>(reader: R, size: u64) -> Result<Fingerprint> {
    let mut limited = reader.take(size);
    if size < SMALL_CONTENT_LIMIT {
        let mut buf = Vec::with_capacity(size as usize);
        limited.read_to_end(&mut buf)?;
        if buf.len() as u64 != size {
            return Err(CasError::SizeMismatch {
                declared: size,
                actual: buf.len() as u64,
            });
        }
        return Ok(Fingerprint::of(&buf));
    }

    let mut hasher = StreamingHasher::new(size)?;
    io::copy(&mut limited, &mut hasher)?;
    hasher.finalize()
}

/// Fingerprint a file on the local filesystem.
pub fn fingerprint_file<P: AsRef<Path>>(path: P) -> Result<Fingerprint> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    fingerprint_reader(file, size)
}
