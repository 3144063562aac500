//! Content digests of registry objects (`sha256:<hex>`), and a reader
//! that checks them while a blob is streamed.

use std::{
    fmt,
    io::{self, Read},
};

use sha2::Digest as _;

use crate::ImportError;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    fn hasher(self) -> Box<dyn digest::DynDigest + Send> {
        match self {
            Algorithm::Sha256 => Box::new(sha2::Sha256::new()),
            Algorithm::Sha512 => Box::new(sha2::Sha512::new()),
        }
    }
}

/// Expected digest of a manifest or a layer.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(try_from = "String")]
pub(crate) struct Digest {
    text: String,
    algorithm: Algorithm,
}

#[derive(thiserror::Error, Debug)]
pub enum DigestError {
    #[error("Invalid digest algorithm.")]
    InvalidAlgorithm,

    #[error("Invalid digest value.")]
    InvalidValue,
}

impl Digest {
    /// The digest as `algorithm:hex`, lowercase.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn expected_hex(&self) -> &str {
        self.text.split_once(':').map_or("", |(_, h)| h)
    }

    /// Wrap `reader` so that reaching EOF fails with
    /// [`ImportError::CorruptSource`] if the data does not match.
    pub fn verify<R: Read>(&self, reader: R) -> impl Read {
        VerifiedReader {
            hasher: self.algorithm.hasher(),
            expected: self.expected_hex().to_owned(),
            reader,
            verified: false,
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        let (algorithm, hex_len) = match text.split_once(':') {
            Some(("sha256", _)) => (Algorithm::Sha256, 64),
            Some(("sha512", _)) => (Algorithm::Sha512, 128),
            _ => return Err(DigestError::InvalidAlgorithm),
        };

        let mut text = text;
        text.make_ascii_lowercase();

        let hex = text.split_once(':').map_or("", |(_, h)| h);
        if hex.len() != hex_len || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::InvalidValue);
        }

        Ok(Digest { text, algorithm })
    }
}

struct VerifiedReader<R> {
    hasher: Box<dyn digest::DynDigest + Send>,
    expected: String,
    reader: R,

    /// Set after the first EOF, so the digest is checked once.
    verified: bool,
}

impl<R: Read> Read for VerifiedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;

        if n == 0 && !buf.is_empty() && !self.verified {
            self.verified = true;

            let mut output = [0u8; 64];
            let output = &mut output[..self.hasher.output_size()];
            self.hasher
                .finalize_into_reset(output)
                .map_err(io::Error::other)?;

            let computed = HexString(&*output).to_string();
            if computed != self.expected {
                return Err(ImportError::CorruptSource(format!(
                    "digest mismatch: expected {}, got {computed}",
                    self.expected
                ))
                .into_io());
            }
        }

        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Lowercase hexadecimal form of a byte buffer.
pub(crate) struct HexString<T>(pub T);

impl<T: AsRef<[u8]>> fmt::Display for HexString<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0
            .as_ref()
            .iter()
            .try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}
