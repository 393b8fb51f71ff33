use image::{Rgba, RgbaImage};

const FALLBACK: Rgba<u8> = Rgba([26, 26, 26, 255]);

/// Alpha-weighted mean color, used to fill the frame around letterboxed photos.
pub fn average_color_rgba(img: &RgbaImage) -> Rgba<u8> {
    let mut sums = [0f64; 3];
    let mut weight = 0f64;
    for pixel in img.pixels() {
        let alpha = pixel[3] as f64 / 255.0;
        if alpha <= 0.0 {
            continue;
        }
        weight += alpha;
        for (sum, channel) in sums.iter_mut().zip(pixel.0) {
            *sum += channel as f64 * alpha;
        }
    }
    if weight <= f64::EPSILON {
        return FALLBACK;
    }
    let [r, g, b] = sums.map(|sum| (sum / weight).round().clamp(0.0, 255.0) as u8);
    Rgba([r, g, b, 255])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_opaque_pixels() {
        let mut img = RgbaImage::from_pixel(2, 1, Rgba([200, 0, 0, 255]));
        img.put_pixel(1, 0, Rgba([0, 0, 100, 255]));
        assert_eq!(average_color_rgba(&img), Rgba([100, 0, 50, 255]));
    }

    #[test]
    fn transparent_images_fall_back_to_dark_gray() {
        let img = RgbaImage::from_pixel(3, 3, Rgba([255, 255, 255, 0]));
        assert_eq!(average_color_rgba(&img), FALLBACK);
    }
}
