//! Update sources and the manifest verification seam.
//!
//! Bundle container parsing and CMS signature checking live outside this
//! engine; the orchestrator asks a [`ManifestVerifier`] to turn a mounted
//! bundle (or a downloaded manifest plus detached signature) into a
//! validated [`Manifest`].

use std::{
    fmt::{self, Display},
    fs, io,
    path::{Path, PathBuf},
    str,
};

use rauc_engine_core::manifest::{self, Manifest};
use tracing::warn;
use url::Url;

/// Name of the manifest file inside a mounted bundle.
pub const MANIFEST_NAME: &str = "manifest.raucm";

/// File suffix selecting the local bundle install path.
pub const BUNDLE_SUFFIX: &str = ".raucb";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("`{input}` is neither a `{BUNDLE_SUFFIX}` bundle path nor a valid URL")]
    Invalid {
        input: String,
        source: url::ParseError,
    },
}

/// What an install request points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateSource {
    /// A locally accessible bundle file.
    Bundle(PathBuf),
    /// A remote manifest; its signature is expected at `<url>.sig`.
    Remote(Url),
}

impl UpdateSource {
    pub fn parse(input: &str) -> Result<Self, SourceError> {
        if input.ends_with(BUNDLE_SUFFIX) {
            return Ok(Self::Bundle(PathBuf::from(input)));
        }
        Url::parse(input)
            .map(Self::Remote)
            .map_err(|source| SourceError::Invalid {
                input: input.to_string(),
                source,
            })
    }
}

impl Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateSource::Bundle(path) => write!(f, "{}", path.display()),
            UpdateSource::Remote(url) => write!(f, "{url}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed reading manifest at `{}`", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("manifest data is not valid UTF-8")]
    Encoding(#[source] str::Utf8Error),
    #[error(transparent)]
    Manifest(#[from] manifest::Error),
    #[error("manifest signature rejected: {0}")]
    SignatureRejected(String),
}

/// Turns raw manifest material into a validated [`Manifest`].
pub trait ManifestVerifier: Send + Sync {
    /// Verifies and loads the manifest of a mounted bundle.
    fn verify_bundle(&self, bundle_mount: &Path) -> Result<Manifest, Error>;

    /// Verifies a downloaded manifest against its detached signature.
    fn verify_detached(
        &self,
        manifest: &[u8],
        signature: &[u8],
    ) -> Result<Manifest, Error>;
}

/// Loads manifests without checking signatures.
///
/// This is the development and test counterpart of a production CMS
/// verifier; deployments are expected to supply their own
/// [`ManifestVerifier`].
pub struct UnverifiedManifestLoader;

impl ManifestVerifier for UnverifiedManifestLoader {
    fn verify_bundle(&self, bundle_mount: &Path) -> Result<Manifest, Error> {
        warn!("bundle signature verification is disabled");
        let path = bundle_mount.join(MANIFEST_NAME);
        let contents = fs::read_to_string(&path)
            .map_err(|source| Error::Read { path, source })?;
        Ok(Manifest::from_toml_str(&contents)?)
    }

    fn verify_detached(
        &self,
        manifest: &[u8],
        _signature: &[u8],
    ) -> Result<Manifest, Error> {
        warn!("manifest signature verification is disabled");
        let contents = str::from_utf8(manifest).map_err(Error::Encoding)?;
        Ok(Manifest::from_toml_str(contents)?)
    }
}
