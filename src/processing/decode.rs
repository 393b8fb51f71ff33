use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use image::{ImageReader, RgbaImage, imageops};
use tracing::{debug, info};

use crate::command::{CommandRunner, CommandTemplate, shell_runner};
use crate::error::PhotoError;

/// Pixel size from the image header, without decoding the pixel data.
pub fn header_dimensions(path: &Path) -> Result<(u32, u32), PhotoError> {
    Ok(ImageReader::open(path)?
        .with_guessed_format()?
        .into_dimensions()?)
}

/// Decodes `path` to RGBA8 with its EXIF orientation applied.
pub fn decode_oriented(path: &Path) -> Result<RgbaImage, PhotoError> {
    let image = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?
        .to_rgba8();
    let orientation = read_orientation(path).unwrap_or(1);
    Ok(apply_orientation(image, orientation))
}

fn read_orientation(path: &Path) -> Option<u32> {
    let file = File::open(path).ok()?;
    let exif = exif::Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .ok()?;
    let orientation = exif
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)?
        .value
        .get_uint(0)?;
    debug!(orientation, path = %path.display(), "exif orientation");
    Some(orientation)
}

pub fn apply_orientation(img: RgbaImage, orientation: u32) -> RgbaImage {
    match orientation {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        7 => imageops::flip_horizontal(&imageops::rotate270(&img)),
        8 => imageops::rotate270(&img),
        _ => img,
    }
}

/// HEIC/HEIF stills, recognised by extension or by their `ftyp` brand.
pub fn is_heif(path: &Path) -> bool {
    let by_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "heic" | "heif"))
        .unwrap_or(false);
    by_extension || has_heif_brand(path)
}

fn has_heif_brand(path: &Path) -> bool {
    let mut header = [0u8; 12];
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    if file.read_exact(&mut header).is_err() {
        return false;
    }
    &header[4..8] == b"ftyp"
        && matches!(
            &header[8..12],
            b"heic" | b"heix" | b"hevc" | b"heim" | b"heis" | b"mif1" | b"msf1"
        )
}

/// Converts HEIC/HEIF files through an external command, since the image
/// stack cannot decode them.
#[derive(Clone)]
pub struct HeifConverter {
    template: Option<CommandTemplate>,
    runner: CommandRunner,
}

impl HeifConverter {
    pub fn new(command: Option<String>) -> Self {
        Self::with_runner(command, shell_runner())
    }

    pub fn with_runner(command: Option<String>, runner: CommandRunner) -> Self {
        Self {
            template: command.map(CommandTemplate::new),
            runner,
        }
    }

    pub fn convert(&self, input: &Path, output: &Path) -> Result<(), PhotoError> {
        let Some(template) = &self.template else {
            return Err(PhotoError::content(
                "HEIC/HEIF photo but no convert-command configured",
            ));
        };
        let command = template.render(&[("@INPUT@", input), ("@OUTPUT@", output)]);
        let result = (self.runner)(&command).map_err(PhotoError::transient)?;
        if !result.status.success() || !output.exists() {
            return Err(PhotoError::content(format!(
                "conversion of {} failed: {}",
                input.display(),
                result.stderr.trim()
            )));
        }
        info!(input = %input.display(), output = %output.display(), "converted HEIF photo");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{StubRunner, output};
    use base64::Engine;
    use image::Rgba;

    // JPEG 2x1 with EXIF orientation 6 (rotate 90 CW), base64 encoded
    const ORIENT6_JPEG: &str = concat!(
        "/9j/4AAQSkZJRgABAQAAAQABAAD/4QAiRXhpZgAATU0AKgAAAAgAAQESAAMAAAABAAYAAAAAAAD/2wBDAAgGBgcGBQgHBwcJCQgKDBQNDAsLDBkSEw8UHRofHh0aHBwgJC4nICIsIxwcKDcpLDAxNDQ0Hyc5PTgyPC4zNDL/",
        "2wBDAQkJCQwLDBgNDRgyIRwhMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjL/wAARCAABAAIDASIAAhEBAxEB/8QAHwAAAQUBAQEBAQEAAAAAAAAAAAECAwQFBgcICQoL/8QAtRAAAgEDAwIEAwUFBAQAAAF9AQIDAAQRBRIhMUEGE1FhByJxFDKBkaEII0KxwRVS0fAkM2JyggkKFhcYGRolJicoKSo0NTY3ODk6Q0RFRkdISUpTVFVWV1hZWmNkZWZnaGlqc3R1dnd4eXqDhIWGh4iJipKTlJWWl5iZmqKjpKWmp6ipqrKztLW2t7i5usLDxMXGx8jJytLT1NXW19jZ2uHi4+Tl5ufo6erx8vP09fb3+Pn6/8QAHwEAAwEBAQEBAQEBAQAAAAAAAAECAwQFBgcICQoL/8QAtREAAgECBAQDBAcFBAQAAQJ3AAECAxEEBSExBhJBUQdhcRMiMoEIFEKRobHBCSMzUvAVYnLRChYkNOEl8RcYGRomJygpKjU2Nzg5OkNERUZHSElKU1RVVldYWVpjZGVmZ2hpanN0dXZ3eHl6goOEhYaHiImKkpOUlZaXmJmaoqOkpaanqKmqsrO0tba3uLm6wsPExcbHyMnK0tPU1dbX2Nna4uPk5ebn6Onq8vP09fb3+Pn6/9oADAMBAAIRAxEAPwDi6KKK+ZP3E//Z"
    );

    #[test]
    fn decodes_with_orientation_applied() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(ORIENT6_JPEG)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orient6.jpg");
        std::fs::write(&path, &bytes).unwrap();
        let img = decode_oriented(&path).unwrap();
        assert_eq!(img.dimensions(), (1, 2));
    }

    #[test]
    fn garbage_is_a_content_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not an image").unwrap();
        let err = decode_oriented(&path).unwrap_err();
        assert!(err.is_permanent(), "{err}");
    }

    #[test]
    fn header_dimensions_ignore_orientation() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(ORIENT6_JPEG)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orient6.jpg");
        std::fs::write(&path, &bytes).unwrap();
        assert_eq!(header_dimensions(&path).unwrap(), (2, 1));

        let broken = dir.path().join("broken.jpg");
        std::fs::write(&broken, b"definitely not an image").unwrap();
        assert!(header_dimensions(&broken).unwrap_err().is_permanent());
    }

    #[test]
    fn missing_file_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let err = decode_oriented(&dir.path().join("nope.jpg")).unwrap_err();
        assert!(!err.is_permanent());
    }

    #[test]
    fn orientation_eight_rotates_counter_clockwise() {
        let mut img = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 255]));
        img.put_pixel(1, 0, Rgba([255, 255, 255, 255]));
        let rotated = apply_orientation(img, 8);
        assert_eq!(rotated.dimensions(), (1, 2));
        assert_eq!(rotated.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn heif_detected_by_brand() {
        let dir = tempfile::tempdir().unwrap();
        let disguised = dir.path().join("photo.bin");
        std::fs::write(&disguised, b"\0\0\0\x18ftypheic\0\0\0\0").unwrap();
        assert!(is_heif(&disguised));
        assert!(is_heif(Path::new("IMG_0001.HEIC")));
        assert!(!is_heif(Path::new("IMG_0001.jpg")));
    }

    #[test]
    fn converter_without_command_rejects() {
        let converter = HeifConverter::with_runner(None, StubRunner::default().into_runner());
        let err = converter
            .convert(Path::new("/tmp/a.heic"), Path::new("/tmp/a.jpg"))
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn converter_runs_template() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.heic");
        let out_path = dir.path().join("a.jpg");
        std::fs::write(&out_path, b"converted").unwrap();
        let stub = StubRunner::default().respond("heif-convert", output(0, "", ""));
        let calls = stub.calls.clone();
        let converter = HeifConverter::with_runner(
            Some("heif-convert @INPUT@ @OUTPUT@".into()),
            stub.into_runner(),
        );
        converter.convert(&input, &out_path).unwrap();
        assert_eq!(
            calls.lock().unwrap()[0],
            format!("heif-convert '{}' '{}'", input.display(), out_path.display())
        );
    }
}
