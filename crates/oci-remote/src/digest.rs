//! Content digests in the canonical `algorithm:hex` form

use crate::errors::{OciDistributionError, Result};
use futures_util::stream::{Stream, StreamExt};
use sha2::Digest as _;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// The hash algorithms a [`Digest`] may be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256, the algorithm every registry supports
    Sha256,
    /// SHA-512
    Sha512,
}

impl Algorithm {
    /// The name used in the string form of a digest.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// The number of hex characters in a digest produced by this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Algorithm::Sha256),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }
}

/// An algorithm-tagged content hash such as
/// `sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a`.
///
/// The hex part is always stored lowercase, so equality is a plain
/// comparison of algorithm and hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// The algorithm this digest was computed with.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex encoding of the hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Computes the SHA-256 digest of an in-memory buffer.
    pub fn sha256_bytes(bytes: &[u8]) -> Self {
        Digest {
            algorithm: Algorithm::Sha256,
            hex: format!("{:x}", sha2::Sha256::digest(bytes)),
        }
    }

    /// Computes the SHA-256 digest of everything `reader` yields.
    ///
    /// Only a fixed-size buffer is held in memory, so this is suitable for
    /// multi-gigabyte layers.
    pub async fn sha256_reader<R: AsyncRead + Unpin>(mut reader: R) -> Result<Self> {
        let mut hasher = Hasher::new(Algorithm::Sha256);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }

    /// Computes the SHA-256 digest of a stream of byte chunks, such as a blob
    /// body returned by the registry.
    pub async fn sha256_stream<S, B, E>(mut stream: S) -> Result<Self>
    where
        S: Stream<Item = std::result::Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        OciDistributionError: From<E>,
    {
        let mut hasher = Hasher::new(Algorithm::Sha256);
        while let Some(chunk) = stream.next().await {
            hasher.update(chunk?.as_ref());
        }
        Ok(hasher.finish())
    }
}

/// Incremental hashing for an [`Algorithm`].
pub(crate) enum Hasher {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl Hasher {
    pub(crate) fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub(crate) fn finish(self) -> Digest {
        match self {
            Hasher::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: format!("{:x}", h.finalize()),
            },
            Hasher::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: format!("{:x}", h.finalize()),
            },
        }
    }
}

impl FromStr for Digest {
    type Err = OciDistributionError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = |reason: &str| {
            OciDistributionError::MalformedDigest(s.to_string(), reason.to_string())
        };

        let (name, hex) = s.split_once(':').ok_or_else(|| malformed("missing ':'"))?;
        if name.is_empty() {
            return Err(malformed("empty algorithm"));
        }
        if hex.is_empty() {
            return Err(malformed("empty hex"));
        }
        let algorithm =
            Algorithm::from_name(name).ok_or_else(|| malformed("unknown algorithm"))?;
        if hex.len() != algorithm.hex_len() {
            return Err(malformed("wrong length for algorithm"));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed("not a hex string"));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = OciDistributionError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl TryFrom<&str> for Digest {
    type Error = OciDistributionError;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
