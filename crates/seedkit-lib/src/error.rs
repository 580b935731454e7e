use std::path::PathBuf;
use std::result;

use thiserror::Error;

pub type Result<T> = result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Timeouts, refused connections and other failures worth retrying.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    /// The remote answered, but with something we can't use.
    #[error("client API error: {0}")]
    Api(String),
    #[error("descriptor failed validation: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    /// On-disk content disagrees with a descriptor in a way that would corrupt seeding.
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("error while encoding or decoding bencode: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("i/o error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Error::TransientNetwork(e.to_string())
        } else if let Some(status) = e.status().filter(|status| status.is_server_error()) {
            Error::TransientNetwork(format!("HTTP {status}: {e}"))
        } else {
            Error::Api(e.to_string())
        }
    }
}

/// Attaches a path to a bare [`std::io::Error`].
pub trait IoContext<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for result::Result<T, std::io::Error> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
