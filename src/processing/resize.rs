use anyhow::{Context, Result, bail};
use fast_image_resize as fir;
use image::{Rgba, RgbaImage, imageops};

use super::layout::center_offset;

pub fn resize_rgba(source: &RgbaImage, target_w: u32, target_h: u32) -> Result<RgbaImage> {
    if target_w == 0 || target_h == 0 {
        bail!("resize dimensions must be positive");
    }
    if source.width() == target_w && source.height() == target_h {
        return Ok(source.clone());
    }

    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .context("failed to create source view for photo resize")?;
    let mut dst_image = fir::images::Image::new(target_w, target_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom));
    fir::Resizer::new()
        .resize(&src_view, &mut dst_image, Some(&options))
        .context("photo resize failed")?;
    RgbaImage::from_raw(target_w, target_h, dst_image.into_vec())
        .context("failed to construct resized RGBA image")
}

/// Centers `image` on a `frame_w` x `frame_h` canvas filled with `fill`,
/// trimming evenly from any axis that is larger than the frame.
pub fn pad_to_frame(image: RgbaImage, frame_w: u32, frame_h: u32, fill: Rgba<u8>) -> RgbaImage {
    if image.width() == frame_w && image.height() == frame_h {
        return image;
    }
    let image = if image.width() > frame_w || image.height() > frame_h {
        let w = image.width().min(frame_w);
        let h = image.height().min(frame_h);
        let (x, y) = center_offset(w, h, image.width(), image.height());
        imageops::crop_imm(&image, x, y, w, h).to_image()
    } else {
        image
    };
    let mut canvas = RgbaImage::from_pixel(frame_w, frame_h, fill);
    let (ox, oy) = center_offset(image.width(), image.height(), frame_w, frame_h);
    imageops::overlay(&mut canvas, &image, ox as i64, oy as i64);
    canvas
}
