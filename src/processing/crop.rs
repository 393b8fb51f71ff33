//! Fits arbitrary photos to the frame while keeping faces in view.

use std::sync::Arc;

use anyhow::Result;
use image::{RgbaImage, imageops};
use tracing::{debug, warn};

use super::color::average_color_rgba;
use super::faces::{FaceBox, FaceDetector};
use super::layout::{contain_dimensions, cover_dimensions, expand_window};
use super::resize::{pad_to_frame, resize_rgba};
use crate::config::FrameSize;

#[derive(Debug)]
pub struct FittedPhoto {
    pub image: RgbaImage,
    /// Faces the detector reported on the cover-scaled image.
    pub faces: usize,
}

#[derive(Clone)]
pub struct CropResizer {
    frame: FrameSize,
    detector: Arc<dyn FaceDetector>,
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    Horizontal,
    Vertical,
}

impl CropResizer {
    pub fn new(frame: FrameSize, detector: Arc<dyn FaceDetector>) -> Self {
        Self { frame, detector }
    }

    pub fn frame(&self) -> FrameSize {
        self.frame
    }

    /// Output is always exactly the frame size.
    pub fn fit(&self, source: &RgbaImage) -> Result<FittedPhoto> {
        let FrameSize { width: fw, height: fh } = self.frame;
        let (cover_w, cover_h) = cover_dimensions(source.width(), source.height(), fw, fh);
        let scaled = resize_rgba(source, cover_w, cover_h)?;
        let fill = average_color_rgba(&scaled);

        let faces = match self.detector.detect(&scaled) {
            Ok(faces) => faces,
            Err(err) => {
                warn!(error = %err, "face detection failed; fitting without faces");
                Vec::new()
            }
        };

        let Some(bounds) = FaceBox::enclosing(&faces, cover_w, cover_h) else {
            let (w, h) = contain_dimensions(cover_w, cover_h, fw, fh);
            debug!(width = w, height = h, "no faces; letterboxing");
            let contained = resize_rgba(&scaled, w, h)?;
            return Ok(FittedPhoto {
                image: pad_to_frame(contained, fw, fh, fill),
                faces: faces.len(),
            });
        };

        let (image, bounds) = crop_axis(scaled, bounds, fw, Axis::Horizontal)?;
        let (image, _) = crop_axis(image, bounds, fh, Axis::Vertical)?;
        debug!(faces = faces.len(), width = image.width(), height = image.height(), "cropped around faces");

        Ok(FittedPhoto {
            image: pad_to_frame(image, fw, fh, fill),
            faces: faces.len(),
        })
    }
}

/// One pass of the face-preserving crop along `axis`. Shrinks the whole image
/// first when the faces alone are longer than the frame.
fn crop_axis(
    mut image: RgbaImage,
    mut bounds: FaceBox,
    frame_len: u32,
    axis: Axis,
) -> Result<(RgbaImage, FaceBox)> {
    let extent = |img: &RgbaImage| match axis {
        Axis::Horizontal => img.width(),
        Axis::Vertical => img.height(),
    };
    if extent(&image) <= frame_len {
        return Ok((image, bounds));
    }

    let span = match axis {
        Axis::Horizontal => bounds.width(),
        Axis::Vertical => bounds.height(),
    };
    if span > frame_len {
        let factor = frame_len as f64 / span as f64;
        let w = ((image.width() as f64 * factor).round() as u32).max(1);
        let h = ((image.height() as f64 * factor).round() as u32).max(1);
        debug!(?axis, factor, width = w, height = h, "shrinking so faces fit");
        image = resize_rgba(&image, w, h)?;
        bounds = bounds.scaled(factor, w, h);
        if extent(&image) <= frame_len {
            return Ok((image, bounds));
        }
    }

    let cropped = match axis {
        Axis::Horizontal => {
            let x = expand_window(bounds.left, bounds.right, frame_len, image.width());
            bounds.left = bounds.left.saturating_sub(x).min(frame_len);
            bounds.right = bounds.right.saturating_sub(x).min(frame_len);
            imageops::crop_imm(&image, x, 0, frame_len, image.height()).to_image()
        }
        Axis::Vertical => {
            let y = expand_window(bounds.top, bounds.bottom, frame_len, image.height());
            bounds.top = bounds.top.saturating_sub(y).min(frame_len);
            bounds.bottom = bounds.bottom.saturating_sub(y).min(frame_len);
            imageops::crop_imm(&image, 0, y, image.width(), frame_len).to_image()
        }
    };
    Ok((cropped, bounds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::faces::NoFaceDetector;
    use image::Rgba;

    struct FixedFaces(Vec<FaceBox>);

    impl FaceDetector for FixedFaces {
        fn detect(&self, _image: &RgbaImage) -> Result<Vec<FaceBox>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    impl FaceDetector for BrokenDetector {
        fn detect(&self, _image: &RgbaImage) -> Result<Vec<FaceBox>> {
            anyhow::bail!("model missing")
        }
    }

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
    const GREEN: Rgba<u8> = Rgba([0, 255, 0, 255]);

    fn frame(width: u32, height: u32) -> FrameSize {
        FrameSize { width, height }
    }

    fn resizer(frame: FrameSize, faces: Vec<FaceBox>) -> CropResizer {
        CropResizer::new(frame, Arc::new(FixedFaces(faces)))
    }

    fn close_to(actual: &Rgba<u8>, expected: Rgba<u8>) -> bool {
        actual
            .0
            .iter()
            .zip(expected.0)
            .all(|(a, e)| (*a as i32 - e as i32).abs() <= 8)
    }

    #[test]
    fn face_near_left_edge_keeps_left_window() {
        // 4000x2000 covers a 1000x1000 frame at 2000x1000; the face box
        // (100,100)-(300,300) lives in that scaled space
        let mut source = RgbaImage::from_pixel(4000, 2000, BLUE);
        for y in 200..600 {
            for x in 200..600 {
                source.put_pixel(x, y, GREEN);
            }
        }
        let face = FaceBox {
            top: 100,
            right: 300,
            bottom: 300,
            left: 100,
        };
        let fitted = resizer(frame(1000, 1000), vec![face]).fit(&source).unwrap();
        assert_eq!(fitted.image.dimensions(), (1000, 1000));
        assert_eq!(fitted.faces, 1);
        assert!(close_to(fitted.image.get_pixel(200, 200), GREEN));
        assert!(close_to(fitted.image.get_pixel(900, 900), BLUE));
    }

    #[test]
    fn face_on_right_edge_slides_window_inside() {
        let mut source = RgbaImage::from_pixel(400, 100, RED);
        for y in 0..100 {
            for x in 300..400 {
                source.put_pixel(x, y, GREEN);
            }
        }
        let face = FaceBox {
            top: 20,
            right: 400,
            bottom: 60,
            left: 360,
        };
        let fitted = resizer(frame(100, 100), vec![face]).fit(&source).unwrap();
        assert_eq!(fitted.image.dimensions(), (100, 100));
        assert!(close_to(fitted.image.get_pixel(99, 50), GREEN));
        assert!(close_to(fitted.image.get_pixel(10, 50), GREEN));
    }

    #[test]
    fn faces_wider_than_frame_shrink_the_photo() {
        let source = RgbaImage::from_pixel(400, 100, RED);
        let face = FaceBox {
            top: 10,
            right: 350,
            bottom: 90,
            left: 50,
        };
        let fitted = resizer(frame(100, 100), vec![face]).fit(&source).unwrap();
        assert_eq!(fitted.image.dimensions(), (100, 100));
        // shrunk to 133x33, cropped to 100 wide, padded vertically
        assert!(close_to(fitted.image.get_pixel(50, 50), RED));
    }

    #[test]
    fn tall_photo_crops_vertically_around_faces() {
        let mut source = RgbaImage::from_pixel(100, 500, BLUE);
        for y in 400..450 {
            for x in 0..100 {
                source.put_pixel(x, y, GREEN);
            }
        }
        let face = FaceBox {
            top: 400,
            right: 80,
            bottom: 450,
            left: 20,
        };
        let fitted = resizer(frame(100, 100), vec![face]).fit(&source).unwrap();
        assert_eq!(fitted.image.dimensions(), (100, 100));
        assert!(close_to(fitted.image.get_pixel(50, 50), GREEN));
    }

    #[test]
    fn no_faces_letterboxes_without_cropping() {
        let mut source = RgbaImage::from_pixel(400, 200, RED);
        for y in 0..200 {
            for x in 200..400 {
                source.put_pixel(x, y, BLUE);
            }
        }
        let fitted = CropResizer::new(frame(100, 100), Arc::new(NoFaceDetector))
            .fit(&source)
            .unwrap();
        assert_eq!(fitted.image.dimensions(), (100, 100));
        assert_eq!(fitted.faces, 0);
        // both halves survive: nothing was cropped away horizontally
        assert!(close_to(fitted.image.get_pixel(2, 50), RED));
        assert!(close_to(fitted.image.get_pixel(97, 50), BLUE));
        // letterbox bands use the average color
        let band = fitted.image.get_pixel(50, 5);
        assert!(close_to(band, Rgba([128, 0, 128, 255])));
    }

    #[test]
    fn detector_errors_fall_back_to_letterbox() {
        let source = RgbaImage::from_pixel(300, 100, RED);
        let fitted = CropResizer::new(frame(60, 60), Arc::new(BrokenDetector))
            .fit(&source)
            .unwrap();
        assert_eq!(fitted.image.dimensions(), (60, 60));
        assert_eq!(fitted.faces, 0);
    }

    #[test]
    fn output_matches_frame_for_degenerate_inputs() {
        let cases = [(1, 1), (1, 500), (500, 1), (30, 20), (2000, 2000)];
        for (w, h) in cases {
            let source = RgbaImage::from_pixel(w, h, RED);
            for faces in [vec![], vec![FaceBox { top: 0, right: 1, bottom: 1, left: 0 }]] {
                let fitted = resizer(frame(64, 48), faces).fit(&source).unwrap();
                assert_eq!(fitted.image.dimensions(), (64, 48), "source {w}x{h}");
            }
        }
    }
}
