use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use super::{Bucket, PhotoMetadata, PhotoRef, PhotoSource};
use crate::error::PhotoError;
use crate::lock;

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "heic", "heif"];

/// Photos in a directory tree, bucketed by capture month (`YYYY-MM`).
///
/// Photo ids are paths relative to the root with `/` separators.
#[derive(Debug)]
pub struct LibrarySource {
    root: PathBuf,
    index: Mutex<LibraryIndex>,
}

#[derive(Debug, Default)]
struct LibraryIndex {
    buckets: BTreeMap<String, Vec<PhotoRef>>,
    metadata: HashMap<String, PhotoMetadata>,
}

impl LibrarySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: Mutex::new(LibraryIndex::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn photo_path(&self, photo_id: &str) -> PathBuf {
        self.root.join(photo_id)
    }

    fn scan(&self) -> Result<LibraryIndex, PhotoError> {
        if !self.root.is_dir() {
            return Err(PhotoError::transient(anyhow::anyhow!(
                "photo library {} is not a directory",
                self.root.display()
            )));
        }
        let mut index = LibraryIndex::default();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if !is_photo(path) || is_hidden(path) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let metadata = describe(&id, path);
            let month = metadata
                .created_at
                .map(|at| at.format("%Y-%m").to_string())
                .unwrap_or_else(|| "0000-00".to_string());
            index.buckets.entry(month.clone()).or_default().push(PhotoRef {
                bucket_id: month,
                photo_id: id.clone(),
            });
            index.metadata.insert(id, metadata);
        }
        for photos in index.buckets.values_mut() {
            photos.sort_by(|a, b| a.photo_id.cmp(&b.photo_id));
        }
        Ok(index)
    }
}

impl PhotoSource for LibrarySource {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn list_buckets(&self) -> Result<Vec<Bucket>, PhotoError> {
        let index = self.scan()?;
        let buckets: Vec<Bucket> = index
            .buckets
            .iter()
            .map(|(month, photos)| Bucket {
                id: month.clone(),
                count: photos.len(),
                time_label: month.clone(),
            })
            .collect();
        info!(
            buckets = buckets.len(),
            photos = index.metadata.len(),
            "scanned photo library"
        );
        *lock(&self.index) = index;
        Ok(buckets)
    }

    fn list_photos(&self, bucket: &Bucket) -> Result<Vec<PhotoRef>, PhotoError> {
        lock(&self.index)
            .buckets
            .get(&bucket.id)
            .cloned()
            .ok_or_else(|| PhotoError::transient(anyhow::anyhow!("unknown bucket {}", bucket.id)))
    }

    fn metadata(&self, photo: &PhotoRef) -> Result<PhotoMetadata, PhotoError> {
        if let Some(known) = lock(&self.index).metadata.get(&photo.photo_id) {
            return Ok(known.clone());
        }
        let path = self.photo_path(&photo.photo_id);
        fs::metadata(&path)?;
        Ok(describe(&photo.photo_id, &path))
    }

    fn fetch(&self, photo: &PhotoRef, destination: &Path) -> Result<u64, PhotoError> {
        let source = self.photo_path(&photo.photo_id);
        let bytes = fs::copy(&source, destination)?;
        debug!(src = %source.display(), dst = %destination.display(), bytes, "copied photo");
        Ok(bytes)
    }
}

fn is_photo(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.starts_with('.'))
}

fn describe(id: &str, path: &Path) -> PhotoMetadata {
    let exif = read_exif(path);
    let captured = exif.as_ref().and_then(capture_time);
    let created_at = captured.or_else(|| Some(file_time(path)));
    let dimensions = image::image_dimensions(path)
        .ok()
        .or_else(|| exif.as_ref().and_then(pixel_dimensions));
    PhotoMetadata {
        id: id.to_string(),
        filename: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string()),
        dimensions,
        created_at,
    }
}

fn read_exif(path: &Path) -> Option<exif::Exif> {
    let file = File::open(path).ok()?;
    exif::Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .ok()
}

fn capture_time(exif: &exif::Exif) -> Option<DateTime<Utc>> {
    let field = exif.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)?;
    let exif::Value::Ascii(parts) = &field.value else {
        return None;
    };
    let raw = std::str::from_utf8(parts.first()?).ok()?;
    NaiveDateTime::parse_from_str(raw.trim(), "%Y:%m:%d %H:%M:%S")
        .ok()
        .map(|at| at.and_utc())
}

fn pixel_dimensions(exif: &exif::Exif) -> Option<(u32, u32)> {
    let width = exif
        .get_field(exif::Tag::PixelXDimension, exif::In::PRIMARY)?
        .value
        .get_uint(0)?;
    let height = exif
        .get_field(exif::Tag::PixelYDimension, exif::In::PRIMARY)?
        .value
        .get_uint(0)?;
    Some((width, height))
}

fn file_time(path: &Path) -> DateTime<Utc> {
    let at = match fs::metadata(path) {
        Ok(meta) => meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or_else(|_| SystemTime::now()),
        Err(_) => SystemTime::now(),
    };
    at.into()
}
