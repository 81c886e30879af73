//! Remote asset retrieval: a primary HTTP mechanism with a single typed fallback.
//!
//! Every attempt downloads into a temporary file created next to the destination, which is
//! only renamed into place once the whole body was received.

mod error;

use std::{
    io::Write,
    path::{Path, PathBuf},
};

pub use error::{FetchError, RetrieveError};
use tracing::{debug, info, warn};
use url::Url;

/// Upper bound on the size of a single downloaded asset.
pub const MAX_ASSET_BYTES: u64 = 1000 * 1024 * 1024;

/// A way of downloading the body behind a URL.
pub trait Retrieve {
    /// Short name used in logs and errors.
    fn mechanism(&self) -> &'static str;

    /// Writes the body behind `url` to `dest`, returning the number of bytes written.
    fn retrieve(&self, url: &Url, dest: &mut dyn Write) -> Result<u64, RetrieveError>;
}

/// Primary mechanism, blocking `ureq` agent.
pub struct UreqRetriever {
    agent: ureq::Agent,
}

impl Default for UreqRetriever {
    fn default() -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

impl Retrieve for UreqRetriever {
    fn mechanism(&self) -> &'static str {
        "ureq"
    }

    fn retrieve(&self, url: &Url, dest: &mut dyn Write) -> Result<u64, RetrieveError> {
        let mut resp = self.agent.get(url.as_str()).call().map_err(from_ureq)?;
        let body = resp
            .body_mut()
            .with_config()
            .limit(MAX_ASSET_BYTES)
            .read_to_vec()
            .map_err(from_ureq)?;
        dest.write_all(&body)?;
        Ok(body.len() as u64)
    }
}

fn from_ureq(err: ureq::Error) -> RetrieveError {
    match err {
        ureq::Error::StatusCode(code) => RetrieveError::Status(code),
        other => RetrieveError::Transport(other.to_string()),
    }
}

/// Fallback mechanism, blocking `reqwest` client.
pub struct ReqwestRetriever {
    client: reqwest::blocking::Client,
}

impl ReqwestRetriever {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder().build()?;
        Ok(Self { client })
    }
}

impl Retrieve for ReqwestRetriever {
    fn mechanism(&self) -> &'static str {
        "reqwest"
    }

    fn retrieve(&self, url: &Url, dest: &mut dyn Write) -> Result<u64, RetrieveError> {
        let resp = self
            .client
            .get(url.as_str())
            .send()
            .map_err(|e| RetrieveError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RetrieveError::Status(status.as_u16()));
        }
        let body = resp
            .bytes()
            .map_err(|e| RetrieveError::Transport(e.to_string()))?;
        if body.len() as u64 > MAX_ASSET_BYTES {
            return Err(RetrieveError::Transport(format!(
                "body of {} bytes exceeds the {MAX_ASSET_BYTES} bytes limit",
                body.len()
            )));
        }
        dest.write_all(&body)?;
        Ok(body.len() as u64)
    }
}

/// Outcome of a successful retrieval.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub path: PathBuf,
    pub bytes: u64,
    /// Mechanism that produced the file.
    pub mechanism: &'static str,
    pub fell_back: bool,
}

pub struct AssetFetcher {
    primary: Box<dyn Retrieve>,
    fallback: Box<dyn Retrieve>,
}

impl AssetFetcher {
    pub fn new(primary: Box<dyn Retrieve>, fallback: Box<dyn Retrieve>) -> Self {
        Self { primary, fallback }
    }

    /// `ureq` first, `reqwest` when the network leg of `ureq` fails.
    pub fn http() -> anyhow::Result<Self> {
        Ok(Self::new(
            Box::new(UreqRetriever::default()),
            Box::new(ReqwestRetriever::new()?),
        ))
    }

    /// Downloads `url` to `dest`.
    ///
    /// Transport and HTTP status failures of the primary mechanism are retried once through
    /// the fallback. Local failures (the destination cannot be written) are returned as
    /// [`FetchError::Primary`] right away since the fallback would hit them too.
    pub fn retrieve(&self, url: &Url, dest: &Path) -> Result<Fetched, FetchError> {
        let primary = self.primary.mechanism();
        match attempt(self.primary.as_ref(), url, dest) {
            Ok(bytes) => {
                info!(
                    "fetched {url} to {} ({}) via {primary}",
                    dest.display(),
                    utils::format_bytes(bytes)
                );
                Ok(Fetched {
                    path: dest.to_path_buf(),
                    bytes,
                    mechanism: primary,
                    fell_back: false,
                })
            }
            Err(err) if !err.is_network() => Err(FetchError::Primary {
                mechanism: primary,
                url: url.clone(),
                source: err,
            }),
            Err(primary_err) => {
                let fallback = self.fallback.mechanism();
                warn!("{primary} failed to fetch {url}: {primary_err}, trying {fallback}");
                match attempt(self.fallback.as_ref(), url, dest) {
                    Ok(bytes) => {
                        info!(
                            "fetched {url} to {} ({}) via {fallback}",
                            dest.display(),
                            utils::format_bytes(bytes)
                        );
                        Ok(Fetched {
                            path: dest.to_path_buf(),
                            bytes,
                            mechanism: fallback,
                            fell_back: true,
                        })
                    }
                    Err(source) => Err(FetchError::Fallback {
                        primary_mechanism: primary,
                        primary: primary_err,
                        mechanism: fallback,
                        url: url.clone(),
                        source,
                    }),
                }
            }
        }
    }

    /// Downloads `url` into `dir`, naming the file after the URL basename.
    pub fn retrieve_into(&self, url: &Url, dir: &Path) -> Result<Fetched, FetchError> {
        let name = local_filename_for(url).ok_or_else(|| FetchError::InvalidUrl(url.clone()))?;
        self.retrieve(url, &dir.join(name))
    }
}

fn attempt(retriever: &dyn Retrieve, url: &Url, dest: &Path) -> Result<u64, RetrieveError> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".fetch-")
        .tempfile_in(dir)?;
    debug!(
        "{} downloading {url} into {}",
        retriever.mechanism(),
        tmp.path().display()
    );
    let bytes = retriever.retrieve(url, tmp.as_file_mut())?;
    tmp.as_file_mut().flush()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(bytes)
}

/// Last non-empty path segment of `url`, e.g. `dog.jpg` for `.../master/dog.jpg`.
pub fn local_filename_for(url: &Url) -> Option<&str> {
    url.path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
}
