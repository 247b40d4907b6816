//! Remote fetching for network installs.
//!
//! The orchestrator only sees the [`Downloader`] trait; the blocking
//! reqwest implementation below is the production default. Downloaded
//! files are verified against their manifest checksum before they count.

use std::{
    fs::{self, File},
    io::{self, Read as _},
    path::{Path, PathBuf},
};

use rauc_engine_core::checksum::{self, Checksum};
use tracing::{info, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed initializing http client")]
    InitClient(#[source] reqwest::Error),
    #[error("request to `{url}` failed")]
    Request { url: Url, source: reqwest::Error },
    #[error("request to `{url}` returned status `{status}`")]
    Status {
        url: Url,
        status: reqwest::StatusCode,
    },
    #[error("response from `{url}` exceeds the {limit} byte limit")]
    TooLarge { url: Url, limit: u64 },
    #[error("failed reading response body from `{url}`")]
    ReadBody { url: Url, source: io::Error },
    #[error("failed opening download target `{}`", path.display())]
    OpenTarget { path: PathBuf, source: io::Error },
    #[error("downloaded file failed checksum verification")]
    Verify(#[from] checksum::Error),
}

pub trait Downloader: Send + Sync {
    /// Fetches a small resource (manifest, signature) into memory,
    /// rejecting anything larger than `limit` bytes.
    fn fetch_mem(&self, url: &Url, limit: u64) -> Result<Vec<u8>, Error>;

    /// Fetches `url` to `dest` and verifies the result against `checksum`;
    /// a mismatching download is deleted.
    fn fetch_file(
        &self,
        url: &Url,
        dest: &Path,
        checksum: &Checksum,
    ) -> Result<(), Error>;
}

/// Blocking HTTP(S) downloader.
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(Error::InitClient)?;
        Ok(Self { client })
    }

    fn get(&self, url: &Url) -> Result<reqwest::blocking::Response, Error> {
        let response =
            self.client.get(url.clone()).send().map_err(|source| {
                Error::Request {
                    url: url.clone(),
                    source,
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: url.clone(),
                status,
            });
        }
        Ok(response)
    }
}

impl Downloader for HttpDownloader {
    fn fetch_mem(&self, url: &Url, limit: u64) -> Result<Vec<u8>, Error> {
        let response = self.get(url)?;
        let mut body = Vec::new();
        response
            .take(limit + 1)
            .read_to_end(&mut body)
            .map_err(|source| Error::ReadBody {
                url: url.clone(),
                source,
            })?;
        if body.len() as u64 > limit {
            return Err(Error::TooLarge {
                url: url.clone(),
                limit,
            });
        }
        Ok(body)
    }

    fn fetch_file(
        &self,
        url: &Url,
        dest: &Path,
        checksum: &Checksum,
    ) -> Result<(), Error> {
        info!("downloading {url} to {}", dest.display());
        let mut response = self.get(url)?;
        let mut target =
            File::create(dest).map_err(|source| Error::OpenTarget {
                path: dest.to_path_buf(),
                source,
            })?;
        io::copy(&mut response, &mut target).map_err(|source| {
            Error::ReadBody {
                url: url.clone(),
                source,
            }
        })?;

        if let Err(err) = checksum.verify(dest) {
            warn!("deleting download with mismatching checksum: {err}");
            if let Err(rm_err) = fs::remove_file(dest) {
                warn!(
                    "failed removing mismatching download `{}`: {rm_err}",
                    dest.display()
                );
            }
            return Err(err.into());
        }
        Ok(())
    }
}
