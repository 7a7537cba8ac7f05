// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Content fingerprints: 128-bit MD5 digests computed incrementally over
//! streamed data, so that transferred payloads can be verified without keeping
//! them in memory.
//!
//! The textual form is the same lowercase hex string `md5sum` prints, which
//! lets fingerprints computed on the host be compared with hashes computed by
//! shell commands inside a guest.

use std::{fmt, io::Read, str::FromStr};

use md5::{Digest, Md5};
use thiserror::Error;

const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FingerprintParseError {
    #[error("fingerprint must be 32 hex characters, got {0} characters")]
    BadLength(usize),

    #[error("invalid fingerprint hex: {0}")]
    BadHex(#[from] hex::FromHexError),
}

/// A 128-bit content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Computes the fingerprint of everything `reader` produces.
    pub fn of_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut builder = FingerprintBuilder::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => builder.update(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(builder.finish())
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut builder = FingerprintBuilder::new();
        builder.update(bytes);
        builder.finish()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 32 {
            return Err(FingerprintParseError::BadLength(s.len()));
        }

        let mut digest = [0u8; 16];
        hex::decode_to_slice(s, &mut digest)?;
        Ok(Self(digest))
    }
}

/// Accumulates data into a running digest.
#[derive(Clone, Default)]
pub struct FingerprintBuilder {
    hasher: Md5,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> Fingerprint {
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&self.hasher.finalize());
        Fingerprint(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_md5sum_output() {
        // `printf 'hello world' | md5sum`
        let fp = Fingerprint::of_bytes(b"hello world");
        assert_eq!(fp.to_string(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn incremental_and_streamed_digests_agree() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut builder = FingerprintBuilder::new();
        for chunk in data.chunks(4093) {
            builder.update(chunk);
        }

        let streamed = Fingerprint::of_reader(&data[..]).unwrap();
        assert_eq!(builder.finish(), streamed);
        assert_eq!(streamed, Fingerprint::of_bytes(&data));
    }

    #[test]
    fn parses_its_own_display_form() {
        let fp = Fingerprint::of_bytes(b"");
        assert_eq!(fp.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
        let parsed: Fingerprint = "D41D8CD98F00B204E9800998ECF8427E\n"
            .parse()
            .expect("uppercase hex with trailing newline should parse");
        assert_eq!(parsed, fp);
        assert!(matches!(
            "abc".parse::<Fingerprint>(),
            Err(FingerprintParseError::BadLength(3))
        ));
    }
}
