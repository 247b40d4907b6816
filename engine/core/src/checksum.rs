//! Digests recorded in manifests and slot status files.
//!
//! Verification is streamed so multi-hundred-megabyte rootfs images never
//! have to fit in memory.

use std::{
    fmt::{self, Display},
    fs::File,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed opening `{}` for hashing", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("failed streaming `{}` into hasher", path.display())]
    Stream { path: PathBuf, source: io::Error },
    #[error(
        "checksum mismatch for `{}`; expected `{expected}`, calculated `{actual}`",
        path.display()
    )]
    Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    #[default]
    Sha256,
}

impl ChecksumKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumKind::Sha256 => "sha256",
        }
    }
}

impl Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded digest, e.g. from a manifest image entry or a slot status file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Checksum {
    #[serde(rename = "type", default)]
    pub kind: ChecksumKind,
    pub digest: String,
}

impl Checksum {
    pub fn sha256<T: Into<String>>(digest: T) -> Self {
        Self {
            kind: ChecksumKind::Sha256,
            digest: digest.into(),
        }
    }

    /// Computes the checksum of the file at `path`.
    pub fn of_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut blob = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut hasher = Sha256::new();
        io::copy(&mut blob, &mut hasher).map_err(|source| Error::Stream {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::sha256(hex::encode(hasher.finalize())))
    }

    /// Verifies that the file at `path` matches this checksum.
    ///
    /// This is the primitive gating every skip and reuse decision in the
    /// install engine.
    pub fn verify<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let actual = Self::of_file(path)?;
        if self.matches(&actual) {
            Ok(())
        } else {
            Err(Error::Mismatch {
                path: path.to_path_buf(),
                expected: self.digest.clone(),
                actual: actual.digest,
            })
        }
    }

    /// Digest equality, ignoring hex case.
    pub fn matches(&self, other: &Checksum) -> bool {
        self.digest.eq_ignore_ascii_case(&other.digest)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.digest)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::{Checksum, Error};

    // sha256 of the ASCII string "hello"
    const HELLO_DIGEST: &str =
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn blob(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn file_digest_matches_known_vector() {
        let file = blob(b"hello");
        let checksum = Checksum::of_file(file.path()).unwrap();
        assert_eq!(HELLO_DIGEST, checksum.digest);
    }

    #[test]
    fn verify_accepts_matching_file() {
        let file = blob(b"hello");
        Checksum::sha256(HELLO_DIGEST).verify(file.path()).unwrap();
    }

    #[test]
    fn verify_accepts_uppercase_digest() {
        let file = blob(b"hello");
        Checksum::sha256(HELLO_DIGEST.to_uppercase())
            .verify(file.path())
            .unwrap();
    }

    #[test]
    fn verify_rejects_other_contents() {
        let file = blob(b"goodbye");
        let err = Checksum::sha256(HELLO_DIGEST)
            .verify(file.path())
            .unwrap_err();
        assert!(matches!(err, Error::Mismatch { .. }));
    }

    #[test]
    fn verify_fails_on_missing_file() {
        let err = Checksum::sha256(HELLO_DIGEST)
            .verify("/nonexistent/blob")
            .unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }
}
