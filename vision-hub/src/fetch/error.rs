//! Error types of the [`super::AssetFetcher`].

use url::Url;

/// Failure of a single retrieval mechanism.
#[derive(thiserror::Error, Debug)]
pub enum RetrieveError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server answered with HTTP status {0}")]
    Status(u16),
    #[error("storing the downloaded bytes: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrieveError {
    /// Network failures are worth retrying through the other mechanism, local ones are not.
    pub fn is_network(&self) -> bool {
        matches!(self, RetrieveError::Transport(_) | RetrieveError::Status(_))
    }
}

/// Failure of [`super::AssetFetcher::retrieve`].
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("cannot derive a local file name from {0}")]
    InvalidUrl(Url),
    /// The primary mechanism failed for a local reason, the fallback was not tried.
    #[error("{mechanism} retrieval of {url} failed")]
    Primary {
        mechanism: &'static str,
        url: Url,
        #[source]
        source: RetrieveError,
    },
    /// The primary mechanism failed on the network and the fallback failed as well.
    #[error("{primary_mechanism} retrieval of {url} failed ({primary}), fallback {mechanism} failed too")]
    Fallback {
        primary_mechanism: &'static str,
        primary: RetrieveError,
        mechanism: &'static str,
        url: Url,
        #[source]
        source: RetrieveError,
    },
}
