use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use super::{AuthOutcome, Bucket, PhotoMetadata, PhotoRef, PhotoSource};
use crate::error::PhotoError;
use crate::lock;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("photo-cache/", env!("CARGO_PKG_VERSION"));

/// An Immich server, optionally narrowed to one album.
pub struct ImmichSource {
    base_url: String,
    album_name: Option<String>,
    agent: ureq::Agent,
    token: Mutex<Option<String>>,
    album_id: Mutex<Option<String>>,
    assets: Mutex<HashMap<String, PhotoMetadata>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlbumDto {
    id: String,
    album_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeBucketDto {
    time_bucket: String,
    count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetDto {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    original_file_name: String,
    file_created_at: Option<DateTime<Utc>>,
    exif_info: Option<ExifInfoDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExifInfoDto {
    exif_image_width: Option<u32>,
    exif_image_height: Option<u32>,
    date_time_original: Option<DateTime<Utc>>,
}

impl AssetDto {
    fn into_metadata(self) -> PhotoMetadata {
        let (dimensions, captured) = match &self.exif_info {
            Some(exif) => (
                exif.exif_image_width.zip(exif.exif_image_height),
                exif.date_time_original,
            ),
            None => (None, None),
        };
        PhotoMetadata {
            id: self.id,
            filename: self.original_file_name,
            dimensions,
            created_at: captured.or(self.file_created_at),
        }
    }
}

impl ImmichSource {
    pub fn new(server_url: &str, album_name: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build();
        Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            album_name,
            agent,
            token: Mutex::new(None),
            album_id: Mutex::new(None),
            assets: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get(&self, path: &str) -> ureq::Request {
        let request = self.agent.get(&self.url(path));
        match lock(&self.token).as_deref() {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }

    fn get_json<T: DeserializeOwned>(&self, request: ureq::Request) -> Result<T, PhotoError> {
        let body = request
            .set("Accept", "application/json")
            .call()
            .map_err(request_error)?
            .into_string()?;
        serde_json::from_str(&body).map_err(|err| {
            PhotoError::transient(anyhow::anyhow!("unexpected response from Immich: {err}"))
        })
    }

    fn resolve_album(&self) -> Result<Option<String>, PhotoError> {
        let Some(name) = &self.album_name else {
            return Ok(None);
        };
        if let Some(id) = lock(&self.album_id).clone() {
            return Ok(Some(id));
        }
        let albums: Vec<AlbumDto> = self.get_json(self.get("/api/albums"))?;
        let album = albums
            .into_iter()
            .find(|album| &album.album_name == name)
            .ok_or_else(|| PhotoError::transient(anyhow::anyhow!("album {name:?} not found")))?;
        info!(album = %name, id = %album.id, "resolved album");
        *lock(&self.album_id) = Some(album.id.clone());
        Ok(Some(album.id))
    }

    fn with_album(&self, request: ureq::Request) -> Result<ureq::Request, PhotoError> {
        Ok(match self.resolve_album()? {
            Some(id) => request.query("albumId", &id),
            None => request,
        })
    }
}

impl PhotoSource for ImmichSource {
    #[instrument(skip(self, credential), fields(server = %self.base_url))]
    fn authenticate(&self, user: &str, credential: &str) -> Result<AuthOutcome, PhotoError> {
        let body = serde_json::json!({ "email": user, "password": credential }).to_string();
        let response = self
            .agent
            .post(&self.url("/api/auth/login"))
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(request_error)?
            .into_string()?;
        let login: LoginResponse = serde_json::from_str(&response)
            .map_err(|err| PhotoError::transient(anyhow::anyhow!("unexpected login response: {err}")))?;
        match login.access_token {
            Some(token) => {
                *lock(&self.token) = Some(token);
                info!("logged in to Immich");
                Ok(AuthOutcome::LoggedIn)
            }
            None => {
                warn!("Immich did not issue a token; password login needs another factor");
                Ok(AuthOutcome::MfaRequired)
            }
        }
    }

    fn list_buckets(&self) -> Result<Vec<Bucket>, PhotoError> {
        let request = self.with_album(self.get("/api/timeline/buckets").query("size", "MONTH"))?;
        let mut buckets: Vec<Bucket> = self
            .get_json::<Vec<TimeBucketDto>>(request)?
            .into_iter()
            .filter(|bucket| bucket.count > 0)
            .map(|bucket| Bucket {
                id: bucket.time_bucket.clone(),
                count: bucket.count,
                time_label: bucket.time_bucket,
            })
            .collect();
        buckets.sort_by(|a, b| a.time_label.cmp(&b.time_label));
        debug!(buckets = buckets.len(), "listed Immich time buckets");
        Ok(buckets)
    }

    fn list_photos(&self, bucket: &Bucket) -> Result<Vec<PhotoRef>, PhotoError> {
        let request = self.with_album(
            self.get("/api/timeline/bucket")
                .query("size", "MONTH")
                .query("timeBucket", &bucket.id),
        )?;
        let assets: Vec<AssetDto> = self.get_json(request)?;
        let mut known = lock(&self.assets);
        let photos = assets
            .into_iter()
            .filter(|asset| asset.kind == "IMAGE")
            .map(|asset| {
                let photo = PhotoRef {
                    bucket_id: bucket.id.clone(),
                    photo_id: asset.id.clone(),
                };
                known.insert(asset.id.clone(), asset.into_metadata());
                photo
            })
            .collect::<Vec<_>>();
        debug!(bucket = %bucket.id, photos = photos.len(), "listed Immich bucket");
        Ok(photos)
    }

    fn metadata(&self, photo: &PhotoRef) -> Result<PhotoMetadata, PhotoError> {
        if let Some(known) = lock(&self.assets).get(&photo.photo_id) {
            return Ok(known.clone());
        }
        let asset: AssetDto = self.get_json(self.get(&format!("/api/assets/{}", photo.photo_id)))?;
        let metadata = asset.into_metadata();
        lock(&self.assets).insert(photo.photo_id.clone(), metadata.clone());
        Ok(metadata)
    }

    fn fetch(&self, photo: &PhotoRef, destination: &Path) -> Result<u64, PhotoError> {
        let response = self
            .get(&format!("/api/assets/{}/thumbnail", photo.photo_id))
            .query("size", "preview")
            .call()
            .map_err(request_error)?;
        let mut out = BufWriter::new(File::create(destination)?);
        let bytes = io::copy(&mut response.into_reader(), &mut out)?;
        out.flush()?;
        debug!(photo = %photo.photo_id, bytes, "downloaded preview");
        Ok(bytes)
    }
}

/// Client errors mean the asset itself is unusable, except timeouts, rate
/// limits and rejected credentials, which say nothing about the asset.
fn request_error(err: ureq::Error) -> PhotoError {
    match err {
        ureq::Error::Status(code, response)
            if (400..500).contains(&code) && !matches!(code, 401 | 403 | 408 | 429) =>
        {
            PhotoError::content(format!("Immich answered {code} for {}", response.get_url()))
        }
        ureq::Error::Status(code, response) => PhotoError::transient(anyhow::anyhow!(
            "Immich answered {code} for {}",
            response.get_url()
        )),
        ureq::Error::Transport(transport) => PhotoError::transient(transport),
    }
}
