use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};
use rayon::prelude::*;
use std::io::Cursor;

/// Asynchronously load an image from bytes using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large images.
pub async fn load_image_from_memory_async(bytes: &[u8]) -> Result<DynamicImage> {
    let bytes = bytes.to_vec(); // Clone to move into blocking task
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).context("Failed to load image from memory")
    })
    .await
    .context("Failed to spawn blocking task for image loading")?
}

/// Asynchronously crop an image using spawn_blocking to avoid blocking the async runtime.
///
/// This is especially important for large images or when cropping many regions,
/// as image cropping is a CPU-intensive synchronous operation.
pub async fn crop_image_async(
    img: DynamicImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || {
        let cropped = img.crop_imm(x, y, width, height);
        Ok(cropped)
    })
    .await
    .context("Failed to spawn blocking task for image cropping")?
}

/// Asynchronously encode an image to PNG bytes using spawn_blocking.
///
/// PNG encoding is CPU-intensive and can block the async runtime if done synchronously.
pub async fn encode_png_async(img: DynamicImage) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut png_bytes = Vec::new();
        let mut cursor = Cursor::new(&mut png_bytes);
        img.write_to(&mut cursor, ImageFormat::Png)
            .context("Failed to encode image as PNG")?;
        Ok(png_bytes)
    })
    .await
    .context("Failed to spawn blocking task for PNG encoding")?
}

/// Asynchronously encode an image to JPEG bytes using spawn_blocking.
pub async fn encode_jpeg_async(img: DynamicImage, quality: u8) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut jpeg_bytes = Vec::new();
        let mut cursor = Cursor::new(&mut jpeg_bytes);
        let encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
        img.to_rgb8()
            .write_with_encoder(encoder)
            .context("Failed to encode image as JPEG")?;
        Ok(jpeg_bytes)
    })
    .await
    .context("Failed to spawn blocking task for JPEG encoding")?
}

/// Clamp a detection box to image bounds, returning `(x, y, width, height)`
/// for cropping. Width or height of zero means the box lies fully outside.
pub fn clamp_box(bbox: &[i32; 4], width: u32, height: u32) -> (u32, u32, u32, u32) {
    let x1 = bbox[0].clamp(0, width as i32) as u32;
    let y1 = bbox[1].clamp(0, height as i32) as u32;
    let x2 = bbox[2].clamp(0, width as i32) as u32;
    let y2 = bbox[3].clamp(0, height as i32) as u32;
    (x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
}

/// Build the feathered alpha mask for seamless region pasting.
///
/// Zero-filled, interior rect `[margin, margin, w-margin, h-margin]` set to
/// 255, then Gaussian-blurred with sigma = margin. A region too small to fit
/// the margin on all sides keeps an all-zero mask, so the blend degrades to
/// keeping the background.
pub fn feather_mask(width: u32, height: u32, margin: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);

    if width <= 2 * margin || height <= 2 * margin {
        return mask;
    }

    for y in margin..(height - margin) {
        for x in margin..(width - margin) {
            mask.put_pixel(x, y, image::Luma([255]));
        }
    }

    if margin == 0 {
        return mask;
    }

    image::imageops::blur(&mask, margin as f32)
}

fn blend(fg: u8, bg: u8, alpha: f32) -> u8 {
    ((fg as f32 * alpha) + (bg as f32 * (1.0 - alpha))) as u8
}

/// Alpha-blend `subject` over `canvas` at `(offset_x, offset_y)` using a
/// gray mask as per-pixel alpha (255 = subject, 0 = canvas).
///
/// `mask` must have the subject's dimensions. The write is clipped to the
/// canvas, so the canvas dimensions never change.
pub fn blend_region(
    canvas: &mut RgbaImage,
    subject: &RgbaImage,
    mask: &GrayImage,
    offset_x: u32,
    offset_y: u32,
) {
    let sub_w = subject.width().min(canvas.width().saturating_sub(offset_x));
    let sub_h = subject.height().min(canvas.height().saturating_sub(offset_y));
    if sub_w == 0 || sub_h == 0 {
        return;
    }

    let stride = canvas.width() as usize * 4;
    let canvas_samples: &mut [u8] = canvas;

    canvas_samples
        .par_chunks_mut(stride)
        .skip(offset_y as usize)
        .take(sub_h as usize)
        .enumerate()
        .for_each(|(row, canvas_row)| {
            let sy = row as u32;
            for sx in 0..sub_w {
                let alpha = mask.get_pixel(sx, sy)[0] as f32 / 255.0;
                let fg = subject.get_pixel(sx, sy);
                let base = (offset_x + sx) as usize * 4;
                for c in 0..4 {
                    canvas_row[base + c] = blend(fg[c], canvas_row[base + c], alpha);
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[tokio::test]
    async fn test_load_image_async() {
        // Create a simple 1x1 red pixel PNG
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([255, 0, 0, 255])));
        let mut png_bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
            .unwrap();

        let result = load_image_from_memory_async(&png_bytes).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_crop_async() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            100,
            100,
            Rgba([255, 0, 0, 255]),
        ));

        let cropped = crop_image_async(img, 10, 10, 50, 40).await.unwrap();
        assert_eq!(cropped.width(), 50);
        assert_eq!(cropped.height(), 40);
    }

    #[tokio::test]
    async fn test_encode_jpeg_async() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 255, 0, 255])));
        let bytes = encode_jpeg_async(img, 95).await.unwrap();
        assert!(!bytes.is_empty());
        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_clamp_box_inside_bounds() {
        assert_eq!(clamp_box(&[10, 20, 50, 60], 100, 100), (10, 20, 40, 40));
    }

    #[test]
    fn test_clamp_box_negative_and_overflow() {
        assert_eq!(clamp_box(&[-5, -10, 120, 130], 100, 100), (0, 0, 100, 100));
    }

    #[test]
    fn test_clamp_box_fully_outside() {
        let (_, _, w, h) = clamp_box(&[200, 200, 300, 300], 100, 100);
        assert_eq!((w, h), (0, 0));
    }

    #[test]
    fn test_feather_mask_shape() {
        let mask = feather_mask(400, 400, 30);
        assert_eq!(mask.dimensions(), (400, 400));

        // Deep interior saturated, corners transparent
        assert_eq!(mask.get_pixel(200, 200)[0], 255);
        assert!(mask.get_pixel(0, 0)[0] < 10);
        assert!(mask.get_pixel(399, 399)[0] < 10);

        // Feather zone sits between the extremes
        let edge = mask.get_pixel(30, 200)[0];
        assert!(edge > 0 && edge < 255);
    }

    #[test]
    fn test_feather_mask_region_too_small_for_margin() {
        let mask = feather_mask(40, 40, 30);
        assert!(mask.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_feather_mask_zero_margin_is_hard_paste() {
        let mask = feather_mask(16, 16, 0);
        assert!(mask.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_blend_extremes() {
        assert_eq!(blend(200, 100, 1.0), 200);
        assert_eq!(blend(200, 100, 0.0), 100);
        assert_eq!(blend(200, 100, 0.5), 150);
    }

    #[test]
    fn test_blend_region_interior_matches_subject() {
        let mut canvas = RgbaImage::from_pixel(500, 500, Rgba([10, 10, 10, 255]));
        let subject = RgbaImage::from_pixel(400, 400, Rgba([200, 50, 25, 255]));
        let mask = feather_mask(400, 400, 30);

        blend_region(&mut canvas, &subject, &mask, 50, 50);

        // Canvas dimensions untouched
        assert_eq!(canvas.dimensions(), (500, 500));

        // Deep interior of the pasted region carries the subject pixels exactly
        assert_eq!(*canvas.get_pixel(250, 250), Rgba([200, 50, 25, 255]));

        // Pixels outside the pasted rectangle stay background
        assert_eq!(*canvas.get_pixel(10, 10), Rgba([10, 10, 10, 255]));
        assert_eq!(*canvas.get_pixel(480, 480), Rgba([10, 10, 10, 255]));
    }

    #[test]
    fn test_blend_region_clips_to_canvas() {
        let mut canvas = RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 255]));
        let subject = RgbaImage::from_pixel(80, 80, Rgba([255, 255, 255, 255]));
        let mask = feather_mask(80, 80, 0);

        // Offset pushes half the subject outside; must not panic or resize
        blend_region(&mut canvas, &subject, &mask, 60, 60);
        assert_eq!(canvas.dimensions(), (100, 100));
        assert_eq!(*canvas.get_pixel(99, 99), Rgba([255, 255, 255, 255]));
        assert_eq!(*canvas.get_pixel(50, 50), Rgba([0, 0, 0, 255]));
    }
}
