//! RGB frame type, pixel-format conversion, downsampling and box drawing.

use image::imageops::{self, FilterType};
use image::RgbImage;

/// A captured camera frame, converted to RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u32,
    pub timestamp: std::time::Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            sequence,
            timestamp: std::time::Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("decode failed: {0}")]
    Decode(String),
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV 4:2:2 to RGB (BT.601, studio range).
///
/// Each 4-byte group `[Y0, U, Y1, V]` yields two pixels sharing chroma.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(yuyv, pixels * 2)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    for group in yuyv[..pixels * 2].chunks_exact(4) {
        let (u, v) = (group[1] as i32 - 128, group[3] as i32 - 128);
        for y in [group[0], group[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(((c + 409 * v + 128) >> 8).clamp(0, 255) as u8);
            rgb.push(((c - 100 * u - 208 * v + 128) >> 8).clamp(0, 255) as u8);
            rgb.push(((c + 516 * u + 128) >> 8).clamp(0, 255) as u8);
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: pixels * 3,
        actual: 0,
    })
}

/// Expand 8-bit grayscale to RGB.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(grey, pixels)?;
    let rgb = grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: pixels,
        actual: grey.len(),
    })
}

/// Copy packed 24-bit RGB.
pub fn rgb24(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let bytes = (width * height * 3) as usize;
    check_len(buf, bytes)?;
    RgbImage::from_raw(width, height, buf[..bytes].to_vec()).ok_or(FrameError::InvalidLength {
        expected: bytes,
        actual: buf.len(),
    })
}

/// Decode a Motion-JPEG frame.
pub fn mjpeg_to_rgb(buf: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| FrameError::Decode(e.to_string()))
}

/// Shrink by an integer factor with bilinear filtering. A factor of 1
/// returns a copy.
pub fn downsample(image: &RgbImage, factor: u32) -> RgbImage {
    if factor <= 1 {
        return image.clone();
    }
    let w = (image.width() / factor).max(1);
    let h = (image.height() / factor).max(1);
    imageops::resize(image, w, h, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_to_rgb_grey_levels() {
        // Neutral chroma: white and black
        let yuyv = vec![235, 128, 16, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([255, 255, 255]));
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_yuyv_to_rgb_red() {
        // BT.601 red: Y=81, U=90, V=240
        let yuyv = vec![81, 90, 81, 240];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        let px = rgb.get_pixel(0, 0);
        assert!(px[0] > 240 && px[1] < 15 && px[2] < 15, "{px:?}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[7, 200], 2, 1).unwrap();
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([7, 7, 7]));
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([200, 200, 200]));
        assert!(grey_to_rgb(&[1], 2, 1).is_err());
    }

    #[test]
    fn test_rgb24() {
        let rgb = rgb24(&[1, 2, 3, 4, 5, 6], 2, 1).unwrap();
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([4, 5, 6]));
    }

    #[test]
    fn test_mjpeg_garbage() {
        assert!(matches!(mjpeg_to_rgb(&[0, 1, 2, 3]), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_downsample_quarter() {
        let image = RgbImage::from_pixel(640, 480, Rgb([10, 20, 30]));
        let small = downsample(&image, 4);
        assert_eq!(small.dimensions(), (160, 120));
        let px = small.get_pixel(80, 60);
        for (got, want) in px.0.iter().zip([10u8, 20, 30]) {
            assert!(got.abs_diff(want) <= 1, "{px:?}");
        }
        assert_eq!(downsample(&image, 1).dimensions(), (640, 480));
    }
}
