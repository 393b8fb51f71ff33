use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use image::RgbaImage;
use tracing::debug;

use crate::command::{CommandRunner, CommandTemplate, shell_runner};

/// Axis-aligned face location in pixel coordinates, `right` and `bottom`
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl FaceBox {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Smallest box containing every face, clipped to a `w` x `h` image.
    /// `None` when nothing visible remains.
    pub fn enclosing(faces: &[FaceBox], w: u32, h: u32) -> Option<FaceBox> {
        let bounds = faces.iter().fold(None::<FaceBox>, |acc, face| {
            Some(match acc {
                None => *face,
                Some(b) => FaceBox {
                    top: b.top.min(face.top),
                    right: b.right.max(face.right),
                    bottom: b.bottom.max(face.bottom),
                    left: b.left.min(face.left),
                },
            })
        })?;
        let clipped = FaceBox {
            top: bounds.top.min(h),
            right: bounds.right.min(w),
            bottom: bounds.bottom.min(h),
            left: bounds.left.min(w),
        };
        (clipped.width() > 0 && clipped.height() > 0).then_some(clipped)
    }

    pub(crate) fn scaled(&self, factor: f64, w: u32, h: u32) -> FaceBox {
        FaceBox {
            top: ((self.top as f64 * factor).floor() as u32).min(h),
            right: ((self.right as f64 * factor).ceil() as u32).min(w),
            bottom: ((self.bottom as f64 * factor).ceil() as u32).min(h),
            left: ((self.left as f64 * factor).floor() as u32).min(w),
        }
    }
}

/// Locates faces in an image. Pure from the caller's point of view.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &RgbaImage) -> Result<Vec<FaceBox>>;
}

/// Detector for setups without face recognition; every photo is
/// letterboxed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaceDetector;

impl FaceDetector for NoFaceDetector {
    fn detect(&self, _image: &RgbaImage) -> Result<Vec<FaceBox>> {
        Ok(Vec::new())
    }
}

/// Runs an external program on a PNG snapshot of the image. The program
/// prints a JSON array of `[top, right, bottom, left]` boxes.
pub struct CommandFaceDetector {
    template: CommandTemplate,
    scratch_dir: PathBuf,
    runner: CommandRunner,
    sequence: AtomicU64,
}

impl CommandFaceDetector {
    pub fn new(command: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self::with_runner(command, scratch_dir, shell_runner())
    }

    pub fn with_runner(
        command: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
        runner: CommandRunner,
    ) -> Self {
        Self {
            template: CommandTemplate::new(command),
            scratch_dir: scratch_dir.into(),
            runner,
            sequence: AtomicU64::new(0),
        }
    }
}

impl FaceDetector for CommandFaceDetector {
    fn detect(&self, image: &RgbaImage) -> Result<Vec<FaceBox>> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        let input = self
            .scratch_dir
            .join(format!(".faces-{}-{n}.png", std::process::id()));
        image
            .save(&input)
            .with_context(|| format!("failed to write {}", input.display()))?;

        let command = self.template.render(&[("@INPUT@", &input)]);
        let result = (self.runner)(&command);
        let _ = std::fs::remove_file(&input);
        let output = result?;
        if !output.status.success() {
            bail!(
                "face detector exited with {:?}: {}",
                output.status.code(),
                output.stderr.trim()
            );
        }
        let faces = parse_faces(&output.stdout)?;
        debug!(faces = faces.len(), "face detector finished");
        Ok(faces)
    }
}

fn parse_faces(stdout: &str) -> Result<Vec<FaceBox>> {
    let raw: Vec<[u32; 4]> =
        serde_json::from_str(stdout.trim()).context("face detector printed invalid JSON")?;
    Ok(raw
        .into_iter()
        .map(|[top, right, bottom, left]| FaceBox {
            top,
            right,
            bottom,
            left,
        })
        .collect())
}
