// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Content digests for replica integrity checks.
//!
//! A [`Digest`] is a 32-bit CRC-32C fingerprint rendered as eight lowercase
//! hex characters. The same string is stored as the object's ETag and
//! compared against replicas during reads and scrubs.

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Read buffer size used when streaming a payload.
const STREAM_CHUNK: usize = 64 * 1024;

/// Fixed-width content fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Digest(u32);

impl Digest {
    /// Wraps a raw digest value.
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw digest value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Renders the digest as lowercase hex.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:08x}", self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 {
            return Err(Error::Internal(format!("digest must be 8 hex chars, got '{s}'")));
        }
        u32::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| Error::Internal(format!("invalid digest '{s}': {e}")))
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_hex()
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Computes and verifies content digests.
pub trait ChecksumCalculator: Send + Sync {
    /// Digests an in-memory payload.
    fn calculate(&self, data: &[u8]) -> Digest;

    /// Digests a payload by streaming it once from `reader`.
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised by the reader.
    fn calculate_reader(&self, reader: &mut dyn Read) -> io::Result<Digest>;

    /// Returns true if `data` digests to `expected`.
    fn verify(&self, data: &[u8], expected: Digest) -> bool {
        self.calculate(data) == expected
    }
}

/// CRC-32C (Castagnoli) calculator. Uses SSE4.2/ARMv8 CRC instructions when
/// the CPU has them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32cCalculator;

impl ChecksumCalculator for Crc32cCalculator {
    fn calculate(&self, data: &[u8]) -> Digest {
        Digest(crc32c::crc32c(data))
    }

    fn calculate_reader(&self, reader: &mut dyn Read) -> io::Result<Digest> {
        let mut buf = vec![0u8; STREAM_CHUNK];
        let mut crc = 0u32;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            crc = crc32c::crc32c_append(crc, &buf[..n]);
        }
        Ok(Digest(crc))
    }
}

/// Digests `data` with the default calculator.
#[must_use]
pub fn digest(data: &[u8]) -> Digest {
    Crc32cCalculator.calculate(data)
}
