//! Turns one candidate into a display-ready file in the cache.
//!
//! Everything here blocks; the worker calls it from the blocking pool.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::SharedCache;
use crate::cache::EvictionReport;
use crate::config::Configuration;
use crate::error::PhotoError;
use crate::lock;
use crate::processing::crop::CropResizer;
use crate::processing::decode::{HeifConverter, decode_oriented, header_dimensions, is_heif};
use crate::processing::tags::{PhotoTags, encode_jpeg};
use crate::source::{Candidate, PhotoMetadata, PhotoSource};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub scratch_dir: PathBuf,
    pub resize_image: bool,
    pub jpeg_quality: u8,
    pub min_dimension: u32,
    pub max_pixels: u64,
    pub keep_original_files: bool,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Configuration) -> Self {
        Self {
            scratch_dir: cfg.scratch_dir.clone(),
            resize_image: cfg.resize_image,
            jpeg_quality: cfg.jpeg_quality,
            min_dimension: cfg.min_dimension,
            max_pixels: cfg.max_pixels,
            keep_original_files: cfg.keep_original_files,
        }
    }
}

#[derive(Debug)]
pub struct ProcessedPhoto {
    pub file_id: String,
    pub size_bytes: u64,
    pub faces: usize,
    pub eviction: EvictionReport,
}

pub struct PhotoPipeline {
    settings: PipelineSettings,
    resizer: CropResizer,
    converter: HeifConverter,
}

impl PhotoPipeline {
    pub fn new(settings: PipelineSettings, resizer: CropResizer, converter: HeifConverter) -> Self {
        Self {
            settings,
            resizer,
            converter,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Rejects photos that are too small or too large to be worth fetching.
    /// Unknown dimensions pass and are read from the image header before decoding.
    pub fn check_metadata(&self, metadata: &PhotoMetadata) -> Result<(), PhotoError> {
        match metadata.dimensions {
            Some(dimensions) => self.check_dimensions(dimensions),
            None => Ok(()),
        }
    }

    pub fn check_dimensions(&self, (width, height): (u32, u32)) -> Result<(), PhotoError> {
        let min = self.settings.min_dimension;
        if width <= min || height <= min {
            return Err(PhotoError::content(format!(
                "{width}x{height} is not larger than {min} pixels on both sides"
            )));
        }
        let pixels = width as u64 * height as u64;
        if pixels > self.settings.max_pixels {
            return Err(PhotoError::content(format!(
                "{width}x{height} exceeds {} pixels",
                self.settings.max_pixels
            )));
        }
        Ok(())
    }

    /// Fetch, convert, decode, fit, tag and persist `candidate`.
    pub fn process(
        &self,
        source: &dyn PhotoSource,
        candidate: &Candidate,
        cache: &SharedCache,
    ) -> Result<ProcessedPhoto, PhotoError> {
        fs::create_dir_all(&self.settings.scratch_dir)?;
        let scratch = ScratchFiles::for_candidate(&self.settings.scratch_dir, candidate);
        let result = self.process_in(source, candidate, cache, &scratch);
        scratch.cleanup(self.settings.keep_original_files);
        result
    }

    fn process_in(
        &self,
        source: &dyn PhotoSource,
        candidate: &Candidate,
        cache: &SharedCache,
        scratch: &ScratchFiles,
    ) -> Result<ProcessedPhoto, PhotoError> {
        let file_id = candidate.file_id();
        let downloaded = source.fetch(&candidate.photo, &scratch.download)?;
        debug!(%file_id, bytes = downloaded, "fetched original");

        let decodable = if is_heif(&scratch.download) {
            self.converter.convert(&scratch.download, &scratch.converted)?;
            &scratch.converted
        } else {
            &scratch.download
        };
        if candidate.metadata.dimensions.is_none() {
            self.check_dimensions(header_dimensions(decodable)?)?;
        }
        let decoded = decode_oriented(decodable)?;

        let (image, faces) = if self.settings.resize_image {
            let fitted = self
                .resizer
                .fit(&decoded)
                .map_err(|err| PhotoError::content(format!("{err:#}")))?;
            (fitted.image, fitted.faces)
        } else {
            (decoded, 0)
        };

        let tags = PhotoTags {
            captured_at: candidate.captured_at(),
            face_count: u16::try_from(faces).unwrap_or(u16::MAX),
        };
        let jpeg = encode_jpeg(&image, self.settings.jpeg_quality, &tags)?;

        let (partial, target) = {
            let cache = lock(cache);
            (cache.partial_path(&file_id), cache.storage_path(&file_id))
        };
        write_atomically(&partial, &target, &jpeg)?;
        let eviction = lock(cache).add(&file_id, &target)?;
        info!(
            %file_id,
            bytes = jpeg.len(),
            faces,
            evicted = eviction.evicted.len(),
            "cached photo"
        );
        Ok(ProcessedPhoto {
            file_id,
            size_bytes: jpeg.len() as u64,
            faces,
            eviction,
        })
    }
}

fn write_atomically(partial: &Path, target: &Path, bytes: &[u8]) -> Result<(), PhotoError> {
    let written = (|| {
        let mut file = fs::File::create(partial)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(partial, target)
    })();
    if written.is_err() {
        let _ = fs::remove_file(partial);
    }
    Ok(written?)
}

struct ScratchFiles {
    download: PathBuf,
    converted: PathBuf,
}

impl ScratchFiles {
    fn for_candidate(dir: &Path, candidate: &Candidate) -> Self {
        let file_id = candidate.file_id();
        let stem = file_id.strip_suffix(".jpg").unwrap_or(&file_id);
        let extension = Path::new(&candidate.metadata.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("orig");
        Self {
            download: dir.join(format!("{stem}.{extension}")),
            converted: dir.join(format!(".{stem}.converted.jpg")),
        }
    }

    fn cleanup(&self, keep_original: bool) {
        let mut doomed = vec![&self.converted];
        if !keep_original {
            doomed.push(&self.download);
        }
        for path in doomed {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove scratch file"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::cache::{CacheBudget, CacheManager};
    use crate::command::testing::StubRunner;
    use crate::config::FrameSize;
    use crate::processing::faces::NoFaceDetector;
    use crate::processing::tags::read_tags;
    use crate::source::{Bucket, PhotoRef};
    use chrono::{TimeZone, Utc};
    use image::{Rgba, RgbaImage};

    /// Serves one in-memory file for any photo.
    struct BytesSource(Vec<u8>);

    impl PhotoSource for BytesSource {
        fn list_buckets(&self) -> Result<Vec<Bucket>, PhotoError> {
            Ok(Vec::new())
        }
        fn list_photos(&self, _bucket: &Bucket) -> Result<Vec<PhotoRef>, PhotoError> {
            Ok(Vec::new())
        }
        fn metadata(&self, _photo: &PhotoRef) -> Result<PhotoMetadata, PhotoError> {
            Err(PhotoError::content("unused"))
        }
        fn fetch(&self, _photo: &PhotoRef, destination: &Path) -> Result<u64, PhotoError> {
            fs::write(destination, &self.0)?;
            Ok(self.0.len() as u64)
        }
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbaImage::from_pixel(w, h, Rgba([200, 100, 50, 255]))
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn candidate(id: &str, dimensions: Option<(u32, u32)>) -> Candidate {
        Candidate {
            photo: PhotoRef {
                bucket_id: "2020-05".into(),
                photo_id: id.into(),
            },
            metadata: PhotoMetadata {
                id: id.into(),
                filename: id.into(),
                dimensions,
                created_at: Some(Utc.with_ymd_and_hms(2020, 5, 17, 9, 15, 0).unwrap()),
            },
        }
    }

    fn fixture(
        root: &Path,
        min_dimension: u32,
        keep_original_files: bool,
    ) -> (PhotoPipeline, SharedCache) {
        let settings = PipelineSettings {
            scratch_dir: root.join("scratch"),
            resize_image: true,
            jpeg_quality: 85,
            min_dimension,
            max_pixels: 1_000_000,
            keep_original_files,
        };
        let resizer = CropResizer::new(
            FrameSize {
                width: 64,
                height: 48,
            },
            Arc::new(NoFaceDetector),
        );
        let converter = HeifConverter::with_runner(None, StubRunner::default().into_runner());
        let cache = CacheManager::initialize(
            root.join("cache"),
            CacheBudget {
                max_available_space: 10_000_000,
            },
            10,
        )
        .unwrap();
        (
            PhotoPipeline::new(settings, resizer, converter),
            Arc::new(Mutex::new(cache)),
        )
    }

    #[test]
    fn metadata_bounds_are_exclusive_at_the_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = fixture(dir.path(), 500, false);
        assert!(pipeline.check_dimensions((500, 800)).unwrap_err().is_permanent());
        assert!(pipeline.check_dimensions((501, 800)).is_ok());
        assert!(pipeline.check_dimensions((2000, 2000)).unwrap_err().is_permanent());
    }

    #[test]
    fn processes_into_tagged_frame_sized_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, cache) = fixture(dir.path(), 10, false);
        let source = BytesSource(png_bytes(120, 60));

        let done = pipeline
            .process(&source, &candidate("beach.png", Some((120, 60))), &cache)
            .unwrap();
        assert_eq!(done.file_id, "beach.jpg");

        let stored = dir.path().join("cache/beach.jpg");
        let decoded = image::open(&stored).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
        let tags = read_tags(&stored).unwrap();
        assert_eq!(
            tags.captured_at,
            Some(Utc.with_ymd_and_hms(2020, 5, 17, 9, 15, 0).unwrap().naive_utc())
        );
        assert!(lock(&cache).contains("beach.jpg"));
        // the download is gone and no partial file is left behind
        assert_eq!(fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
        assert_eq!(fs::read_dir(dir.path().join("cache")).unwrap().count(), 1);
    }

    #[test]
    fn keeps_originals_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, cache) = fixture(dir.path(), 10, true);
        let source = BytesSource(png_bytes(40, 40));
        pipeline
            .process(&source, &candidate("x.png", None), &cache)
            .unwrap();
        assert!(dir.path().join("scratch/x.png").exists());
    }

    #[test]
    fn unknown_sizes_are_checked_from_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, cache) = fixture(dir.path(), 100, false);
        let source = BytesSource(png_bytes(40, 40));
        let err = pipeline
            .process(&source, &candidate("tiny.png", None), &cache)
            .unwrap_err();
        assert!(err.is_permanent());

        // pixel data cut short: only the header can be read, so a decode
        // attempt would fail differently
        let mut huge = png_bytes(1100, 1000);
        huge.truncate(huge.len() / 2);
        let err = pipeline
            .process(&BytesSource(huge), &candidate("huge.png", None), &cache)
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("exceeds 1000000 pixels"), "{err}");
        assert!(lock(&cache).is_empty());
    }

    #[test]
    fn undecodable_content_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, cache) = fixture(dir.path(), 10, false);
        let source = BytesSource(b"<html>not found</html>".to_vec());
        let err = pipeline
            .process(&source, &candidate("broken.jpg", Some((800, 600))), &cache)
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn heif_without_converter_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, cache) = fixture(dir.path(), 10, false);
        let source = BytesSource(b"\0\0\0\x18ftypheic\0\0\0\0".to_vec());
        let err = pipeline
            .process(&source, &candidate("IMG_1.HEIC", Some((800, 600))), &cache)
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
