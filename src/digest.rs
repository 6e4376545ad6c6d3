//! Content digests and hashing I/O adapters.
//!
//! A [`Digest`] is the identity of a blob: `<algorithm>:<hex>`. Only one
//! algorithm is recognised today, but it is carried as a value
//! ([`DigestAlgorithm`]) rather than hard-wired so stores can be configured
//! with a different one later without a format change.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
}

impl DigestAlgorithm {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }

    /// Length of the hex-encoded hash.
    pub const fn encoded_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
        }
    }

    pub fn digester(self) -> Digester {
        match self {
            Self::Sha256 => Digester::Sha256(Sha256::new()),
        }
    }

    /// Hash a byte slice in one go.
    pub fn digest_bytes(self, data: &[u8]) -> Digest {
        let mut digester = self.digester();
        digester.update(data);
        digester.finish()
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            other => Err(Error::NotImplemented(format!(
                "digest algorithm '{other}'"
            ))),
        }
    }
}

/// An algorithm-tagged content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: DigestAlgorithm,
    encoded: String,
}

impl Digest {
    /// Builds a digest from an algorithm and its hex encoding, validating the latter.
    pub fn new(algorithm: DigestAlgorithm, encoded: &str) -> Result<Self> {
        let valid = encoded.len() == algorithm.encoded_len()
            && encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(Error::Invalid(format!(
                "malformed {algorithm} digest '{encoded}'"
            )));
        }
        Ok(Self {
            algorithm,
            encoded: encoded.to_owned(),
        })
    }

    pub const fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The hex part of the digest, without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// A filesystem-safe rendering (`sha256_<hex>`), used for bundle file names.
    pub fn to_file_stem(&self) -> String {
        format!("{}_{}", self.algorithm, self.encoded)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| Error::Invalid(format!("digest '{s}' has no algorithm prefix")))?;
        Self::new(algorithm.parse()?, encoded)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

/// Incremental hasher for one [`DigestAlgorithm`].
#[derive(Clone)]
pub enum Digester {
    Sha256(Sha256),
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Digest {
        match self {
            Self::Sha256(h) => Digest {
                algorithm: DigestAlgorithm::Sha256,
                encoded: hex::encode(h.finalize()),
            },
        }
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A reader that hashes and counts everything read through it.
pub struct DigestReader<R> {
    inner: R,
    digester: Digester,
    size: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R, algorithm: DigestAlgorithm) -> Self {
        Self {
            inner,
            digester: algorithm.digester(),
            size: 0,
        }
    }

    /// Digest and byte count of everything read so far.
    pub fn finish(self) -> (Digest, u64) {
        (self.digester.finish(), self.size)
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }
}

/// A reader that checks its content against an expected digest once it hits EOF.
///
/// A mismatch is reported as an [`io::ErrorKind::InvalidData`] error from the
/// final `read`, so corrupted blobs never read back silently.
pub struct VerifiedReader<R> {
    inner: R,
    expected: Digest,
    digester: Option<Digester>,
}

impl<R: Read> VerifiedReader<R> {
    pub fn new(inner: R, expected: Digest) -> Self {
        let digester = Some(expected.algorithm().digester());
        Self {
            inner,
            expected,
            digester,
        }
    }
}

impl<R: Read> Read for VerifiedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(digester) = self.digester.as_mut() {
                digester.update(&buf[..n]);
            }
            return Ok(n);
        }
        // Only verify on the first EOF; later reads just keep returning 0.
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(digester) = self.digester.take() {
            let actual = digester.finish();
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "blob digest mismatch: expected {} got {actual}",
                        self.expected
                    ),
                ));
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_digest_bytes_known_value() {
        let digest = DigestAlgorithm::Sha256.digest_bytes(b"hello");
        assert_eq!(digest.to_string(), format!("sha256:{HELLO}"));
        assert_eq!(digest.encoded(), HELLO);
        assert_eq!(digest.to_file_stem(), format!("sha256_{HELLO}"));
    }

    #[test]
    fn test_parse_rejects_bad_digests() {
        assert!(format!("sha256:{HELLO}").parse::<Digest>().is_ok());
        assert!(matches!(
            "sha256:abc".parse::<Digest>(),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            format!("sha256:{}", HELLO.to_uppercase()).parse::<Digest>(),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            format!("sha512:{HELLO}").parse::<Digest>(),
            Err(Error::NotImplemented(_))
        ));
        assert!("nocolon".parse::<Digest>().is_err());
    }

    #[test]
    fn test_digest_serde_as_string() {
        let digest = DigestAlgorithm::Sha256.digest_bytes(b"hello");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"sha256:{HELLO}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert!(serde_json::from_str::<Digest>("\"sha256:zz\"").is_err());
    }

    #[test]
    fn test_digest_reader_counts_and_hashes() {
        let mut reader = DigestReader::new(&b"hello"[..], DigestAlgorithm::Sha256);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        let (digest, size) = reader.finish();
        assert_eq!(size, 5);
        assert_eq!(digest.encoded(), HELLO);
    }

    #[test]
    fn test_verified_reader_detects_mismatch() {
        let expected = DigestAlgorithm::Sha256.digest_bytes(b"hello");

        let mut ok = VerifiedReader::new(&b"hello"[..], expected.clone());
        let mut out = Vec::new();
        ok.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");

        let mut bad = VerifiedReader::new(&b"jello"[..], expected);
        let err = bad.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
