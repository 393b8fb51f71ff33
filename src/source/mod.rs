//! Where photos come from. Providers expose the same bucketed view of a
//! library: time-ordered buckets, the photos inside each, per-photo
//! metadata and the bytes themselves.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::PhotoError;

pub mod immich;
pub mod library;

pub use immich::ImmichSource;
pub use library::LibrarySource;

/// A time-ordered group of photos. `time_label` sorts chronologically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub id: String,
    pub count: usize,
    pub time_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhotoRef {
    pub bucket_id: String,
    pub photo_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoMetadata {
    pub id: String,
    pub filename: String,
    /// Pixel dimensions, when the provider knows them without decoding.
    pub dimensions: Option<(u32, u32)>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    LoggedIn,
    /// The account needs a second factor, which this process cannot supply.
    MfaRequired,
}

/// Blocking access to a photo provider. Callers run these on the blocking
/// pool.
pub trait PhotoSource: Send + Sync {
    fn authenticate(&self, _user: &str, _credential: &str) -> Result<AuthOutcome, PhotoError> {
        Ok(AuthOutcome::LoggedIn)
    }

    fn list_buckets(&self) -> Result<Vec<Bucket>, PhotoError>;

    fn list_photos(&self, bucket: &Bucket) -> Result<Vec<PhotoRef>, PhotoError>;

    fn metadata(&self, photo: &PhotoRef) -> Result<PhotoMetadata, PhotoError>;

    /// Writes the photo to `destination` and returns the number of bytes.
    fn fetch(&self, photo: &PhotoRef, destination: &Path) -> Result<u64, PhotoError>;
}

/// A photo picked for processing, with its metadata resolved.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub photo: PhotoRef,
    pub metadata: PhotoMetadata,
}

impl Candidate {
    pub fn file_id(&self) -> String {
        cache_file_id(&self.photo.photo_id)
    }

    pub fn captured_at(&self) -> Option<NaiveDateTime> {
        self.metadata.created_at.map(|at| at.naive_utc())
    }
}

/// Name of the cached JPEG for a source photo id: the id without its
/// extension, restricted to `[A-Za-z0-9_-]`, plus `.jpg`.
pub fn cache_file_id(photo_id: &str) -> String {
    let stem = match photo_id.rfind('.') {
        Some(dot) if dot > 0 && !photo_id[dot..].contains('/') => &photo_id[..dot],
        _ => photo_id,
    };
    let mut id: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    id.push_str(".jpg");
    id
}
