use std::path::PathBuf;

use thiserror::Error;

/// Fatal cache problems surfaced at startup.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The working directory could not be created or scanned.
    #[error("cache directory {path} is unusable")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Free space for the working directory could not be determined.
    #[error("failed to compute the cache budget for {path}")]
    Budget {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a single photo could not be cached.
///
/// Transient failures leave the photo eligible for a later run; content
/// failures put it on the rejection list for good.
#[derive(Debug, Error)]
pub enum PhotoError {
    /// Network hiccups, temporary file locks, full disks.
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),

    /// Out-of-bounds dimensions, unsupported or undecodable content.
    #[error("unusable photo: {0}")]
    Content(String),
}

impl PhotoError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        PhotoError::Transient(err.into())
    }

    pub fn content(reason: impl Into<String>) -> Self {
        PhotoError::Content(reason.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, PhotoError::Content(_))
    }
}

impl From<std::io::Error> for PhotoError {
    fn from(err: std::io::Error) -> Self {
        PhotoError::Transient(err.into())
    }
}

impl From<image::ImageError> for PhotoError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(io) => PhotoError::Transient(io.into()),
            other => PhotoError::Content(other.to_string()),
        }
    }
}
