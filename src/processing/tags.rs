//! JPEG output with the metadata the frame carries forward: capture time
//! and the number of detected faces.

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDateTime;
use exif::experimental::Writer;
use exif::{Field, In, Rational, Tag, Value};
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::{RgbImage, RgbaImage};

use crate::error::PhotoError;

const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";
const ARTIST: &str = "PhotoFrame";
const SOFTWARE: &str = concat!("photo-cache ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhotoTags {
    pub captured_at: Option<NaiveDateTime>,
    pub face_count: u16,
}

pub fn encode_jpeg(image: &RgbaImage, quality: u8, tags: &PhotoTags) -> Result<Vec<u8>, PhotoError> {
    let rgb: RgbImage = image.convert();
    let mut jpeg = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, quality))?;
    let tiff = exif_block(tags).map_err(PhotoError::transient)?;
    splice_app1(jpeg, &tiff).map_err(PhotoError::transient)
}

fn exif_block(tags: &PhotoTags) -> Result<Vec<u8>> {
    let resolution = Value::Rational(vec![Rational { num: 96, denom: 1 }]);
    let mut fields = vec![
        Field {
            tag: Tag::Artist,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![ARTIST.as_bytes().to_vec()]),
        },
        Field {
            tag: Tag::Software,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![SOFTWARE.as_bytes().to_vec()]),
        },
        Field {
            tag: Tag::XResolution,
            ifd_num: In::PRIMARY,
            value: resolution.clone(),
        },
        Field {
            tag: Tag::YResolution,
            ifd_num: In::PRIMARY,
            value: resolution,
        },
        Field {
            tag: Tag::SubjectArea,
            ifd_num: In::PRIMARY,
            value: Value::Short(vec![tags.face_count]),
        },
    ];
    if let Some(captured) = tags.captured_at {
        let stamp = captured.format(EXIF_DATE_FORMAT).to_string();
        fields.push(Field {
            tag: Tag::DateTimeOriginal,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![stamp.into_bytes()]),
        });
    }

    let mut writer = Writer::new();
    for field in &fields {
        writer.push_field(field);
    }
    let mut tiff = Cursor::new(Vec::new());
    writer
        .write(&mut tiff, false)
        .map_err(|err| anyhow!("failed to serialise EXIF: {err}"))?;
    Ok(tiff.into_inner())
}

/// Inserts an APP1 Exif segment after SOI and any JFIF APP0 header.
fn splice_app1(jpeg: Vec<u8>, tiff: &[u8]) -> Result<Vec<u8>> {
    anyhow::ensure!(jpeg.starts_with(&[0xFF, 0xD8]), "encoder produced no SOI marker");
    let payload_len = 2 + 6 + tiff.len();
    let segment_len = u16::try_from(payload_len).context("EXIF block too large for APP1")?;

    let mut insert_at = 2;
    if jpeg.get(2..4) == Some(&[0xFF, 0xE0][..]) {
        let app0_len = jpeg
            .get(4..6)
            .map(|len| u16::from_be_bytes([len[0], len[1]]) as usize)
            .context("truncated APP0 segment")?;
        insert_at = 4 + app0_len;
    }
    anyhow::ensure!(insert_at <= jpeg.len(), "truncated JPEG header");

    let mut out = Vec::with_capacity(jpeg.len() + payload_len + 2);
    out.extend_from_slice(&jpeg[..insert_at]);
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&segment_len.to_be_bytes());
    out.extend_from_slice(b"Exif\0\0");
    out.extend_from_slice(tiff);
    out.extend_from_slice(&jpeg[insert_at..]);
    Ok(out)
}

/// Reads back the tags written by [`encode_jpeg`]. Missing tags are left at
/// their defaults.
pub fn read_tags(path: &Path) -> Result<PhotoTags> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let exif = exif::Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .with_context(|| format!("no EXIF block in {}", path.display()))?;

    let captured_at = match exif.get_field(Tag::DateTimeOriginal, In::PRIMARY).map(|f| &f.value) {
        Some(Value::Ascii(parts)) => parts
            .first()
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|raw| NaiveDateTime::parse_from_str(raw.trim(), EXIF_DATE_FORMAT).ok()),
        _ => None,
    };
    let face_count = exif
        .get_field(Tag::SubjectArea, In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .and_then(|n| u16::try_from(n).ok())
        .unwrap_or(0);
    Ok(PhotoTags {
        captured_at,
        face_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use image::Rgba;

    #[test]
    fn written_tags_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagged.jpg");
        let captured = NaiveDate::from_ymd_opt(2019, 7, 14)
            .unwrap()
            .and_hms_opt(18, 30, 5)
            .unwrap();
        let tags = PhotoTags {
            captured_at: Some(captured),
            face_count: 3,
        };
        let image = RgbaImage::from_pixel(16, 8, Rgba([40, 80, 120, 255]));
        std::fs::write(&path, encode_jpeg(&image, 90, &tags).unwrap()).unwrap();

        assert_eq!(read_tags(&path).unwrap(), tags);
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn missing_capture_time_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("undated.jpg");
        let image = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        std::fs::write(&path, encode_jpeg(&image, 80, &PhotoTags::default()).unwrap()).unwrap();
        let tags = read_tags(&path).unwrap();
        assert_eq!(tags.captured_at, None);
        assert_eq!(tags.face_count, 0);
    }
}
