use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::Deserialize;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Directory holding the processed, display-ready photos.
    pub working_dir: PathBuf,
    /// Where downloads and conversion intermediates land before processing.
    pub scratch_dir: PathBuf,
    /// Durable list of photo ids that must never be fetched again.
    pub rejection_file: PathBuf,
    /// Album shown on the status page. `None` means the whole library.
    pub album_name: Option<String>,
    /// Upper bound for the cache size, in gigabytes.
    pub max_space_gb: f64,
    /// Free space that must remain on the volume, in gigabytes.
    pub disk_reserve_gb: f64,
    /// Exponent knob for the per-bucket sampling weights.
    pub recency_bias: f64,
    /// Deterministic RNG seed for sampling and throttle jitter.
    pub sampling_seed: Option<u64>,
    pub frame: FrameSize,
    /// When false, photos are re-encoded without cropping or scaling.
    pub resize_image: bool,
    pub jpeg_quality: u8,
    /// Photos must be strictly larger than this on both axes.
    pub min_dimension: u32,
    /// Photos with more pixels than this are rejected before download.
    pub max_pixels: u64,
    /// Keep the downloaded originals in the scratch directory.
    pub keep_original_files: bool,
    /// Failed deletions tolerated per eviction pass.
    pub eviction_retry_limit: u32,
    pub throttle: ThrottleOptions,
    pub source: SourceConfig,
    pub face_detector: Option<FaceDetectorConfig>,
    /// Shell command converting HEIC/HEIF files; `@INPUT@` and `@OUTPUT@` are substituted.
    pub convert_command: Option<String>,
    pub status_channel: StatusChannelConfig,
    pub control: Option<ControlConfig>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/var/cache/photo-frame/photos"),
            scratch_dir: PathBuf::from("/var/cache/photo-frame/scratch"),
            rejection_file: PathBuf::from("/var/lib/photo-frame/rejected.txt"),
            album_name: None,
            max_space_gb: 4.0,
            disk_reserve_gb: 1.0,
            recency_bias: 0.5,
            sampling_seed: None,
            frame: FrameSize::default(),
            resize_image: true,
            jpeg_quality: 90,
            min_dimension: 500,
            max_pixels: 15_000_000,
            keep_original_files: false,
            eviction_retry_limit: 10,
            throttle: ThrottleOptions::default(),
            source: SourceConfig::default(),
            face_detector: None,
            convert_command: None,
            status_channel: StatusChannelConfig::default(),
            control: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl Default for FrameSize {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ThrottleOptions {
    /// Cached files per second of delay.
    pub divisor: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            divisor: 100,
            min_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case",
    deny_unknown_fields
)]
pub enum SourceConfig {
    /// A directory tree of photos on a local or mounted filesystem.
    Library { path: PathBuf },
    /// An Immich server reached over its REST API.
    Immich {
        server_url: String,
        user: String,
        password: String,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Library {
            path: PathBuf::from("/var/lib/photo-frame/library"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaceDetectorConfig {
    /// Invoked with `@INPUT@` replaced by a PNG path; prints a JSON list of
    /// `[top, right, bottom, left]` boxes on stdout.
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct StatusChannelConfig {
    /// Where status snapshots and screen commands are published.
    pub publish_addr: String,
    /// Publisher of displayed-photo notices on the frame side.
    pub command_addr: String,
}

impl Default for StatusChannelConfig {
    fn default() -> Self {
        Self {
            publish_addr: "127.0.0.1:5556".to_string(),
            command_addr: "127.0.0.1:5557".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ControlConfig {
    pub bind_addr: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that serde defaults cannot express.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            self.recency_bias.is_finite() && (0.0..=1.0).contains(&self.recency_bias),
            "recency-bias must be between 0 and 1"
        );
        ensure!(
            self.max_space_gb.is_finite() && self.max_space_gb > 0.0,
            "max-space-gb must be greater than zero"
        );
        ensure!(
            self.disk_reserve_gb.is_finite() && self.disk_reserve_gb >= 0.0,
            "disk-reserve-gb must not be negative"
        );
        ensure!(
            self.frame.width > 0 && self.frame.height > 0,
            "frame width and height must be greater than zero"
        );
        ensure!(
            (1..=100).contains(&self.jpeg_quality),
            "jpeg-quality must be between 1 and 100"
        );
        ensure!(self.max_pixels > 0, "max-pixels must be greater than zero");
        ensure!(
            self.eviction_retry_limit > 0,
            "eviction-retry-limit must be greater than zero"
        );
        ensure!(
            self.throttle.divisor > 0,
            "throttle.divisor must be greater than zero"
        );
        if let Some(command) = &self.convert_command {
            ensure!(
                command.contains("@INPUT@") && command.contains("@OUTPUT@"),
                "convert-command must reference both @INPUT@ and @OUTPUT@"
            );
        }
        if let Some(detector) = &self.face_detector {
            ensure!(
                detector.command.contains("@INPUT@"),
                "face-detector.command must reference @INPUT@"
            );
        }
        if let SourceConfig::Immich {
            server_url, user, ..
        } = &self.source
        {
            ensure!(
                !server_url.trim().is_empty(),
                "source.server-url must not be blank"
            );
            ensure!(!user.trim().is_empty(), "source.user must not be blank");
        }
        ensure!(
            self.working_dir != self.scratch_dir,
            "scratch-dir must differ from working-dir"
        );
        Ok(self)
    }

    pub fn max_space_bytes(&self) -> u64 {
        (self.max_space_gb * BYTES_PER_GB) as u64
    }

    pub fn disk_reserve_bytes(&self) -> u64 {
        (self.disk_reserve_gb * BYTES_PER_GB) as u64
    }

    pub fn album_label(&self) -> &str {
        self.album_name.as_deref().unwrap_or("All Photos")
    }
}
