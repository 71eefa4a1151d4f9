// src/fetch/checksum.rs

//! CRC32C validation of response bodies.
//!
//! The archive host attaches an `x-goog-hash` header carrying a base64
//! big-endian CRC32C (Castagnoli) of the body. The checksum is folded over
//! the stream as it is consumed and checked when the stream ends, so callers
//! never see bytes that have not been accounted for.

use base64::Engine;
use std::fmt;
use std::io::{self, Read};

/// Header carrying the archive checksums.
pub const GOOG_HASH_HEADER: &str = "x-goog-hash";

/// Marker payload for checksum failures, carried inside an [`io::Error`] so
/// the retry loop can classify the failure as retryable.
#[derive(Debug)]
pub struct Crc32cMismatch {
    pub expected: u32,
    pub actual: u32,
}

impl fmt::Display for Crc32cMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CRC32C checksum mismatch: expected {:08x}, computed {:08x}",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for Crc32cMismatch {}

/// Extract the expected CRC32C from an `x-goog-hash` header value.
///
/// The header is a comma-separated list of `<alg>=<base64>` pairs; only the
/// `crc32c` entry is used. The payload must decode to exactly four bytes,
/// interpreted big-endian. Malformed values are ignored rather than failing
/// the download.
pub fn parse_crc32c_header(value: &str) -> Option<u32> {
    for part in value.split(',') {
        let part = part.trim();
        if let Some(encoded) = part.strip_prefix("crc32c=") {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok()?;
            let bytes: [u8; 4] = bytes.try_into().ok()?;
            return Some(u32::from_be_bytes(bytes));
        }
    }
    None
}

/// A reader that folds CRC32C over everything read and fails at end of
/// stream if the digest does not match the expected value.
pub struct Crc32cReader<R> {
    inner: R,
    expected: u32,
    state: u32,
    verified: bool,
}

impl<R: Read> Crc32cReader<R> {
    pub fn new(inner: R, expected: u32) -> Self {
        Self {
            inner,
            expected,
            state: 0,
            verified: false,
        }
    }
}

impl<R: Read> Read for Crc32cReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.state = crc32c::crc32c_append(self.state, &buf[..n]);
        } else if !self.verified {
            self.verified = true;
            if self.state != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    Crc32cMismatch {
                        expected: self.expected,
                        actual: self.state,
                    },
                ));
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_crc(value: u32) -> String {
        format!(
            "crc32c={}",
            base64::engine::general_purpose::STANDARD.encode(value.to_be_bytes())
        )
    }

    #[test]
    fn test_parse_crc32c_header() {
        let crc = crc32c::crc32c(b"hello world");
        let header = format!("md5=ignored, {}", encode_crc(crc));
        assert_eq!(parse_crc32c_header(&header), Some(crc));
    }

    #[test]
    fn test_parse_crc32c_header_missing_or_malformed() {
        assert_eq!(parse_crc32c_header("md5=abcd"), None);
        assert_eq!(parse_crc32c_header("crc32c=!!!"), None);
        // Wrong payload length.
        let bad = format!(
            "crc32c={}",
            base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3])
        );
        assert_eq!(parse_crc32c_header(&bad), None);
    }

    #[test]
    fn test_reader_accepts_matching_stream() {
        let body = b"package archive bytes";
        let mut reader = Crc32cReader::new(&body[..], crc32c::crc32c(body));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn test_reader_rejects_mismatched_stream() {
        let body = b"package archive bytes";
        let mut reader = Crc32cReader::new(&body[..], crc32c::crc32c(b"other bytes"));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err
            .get_ref()
            .map_or(false, |inner| inner.is::<Crc32cMismatch>()));
    }
}
