//! Image decoding and preprocessing — small-image upscaling, low-light CLAHE
//! on the luminance channel, and unsharp-mask sharpening.

use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

// --- Named constants ---
/// Images whose shorter side is below this are upscaled to it.
pub const MIN_SIDE: u32 = 480;
/// Mean 8-bit luminance at or below which low-light enhancement is applied.
const LOW_LIGHT_LUMINANCE: f32 = 100.0;
const CLAHE_CLIP_LIMIT: f32 = 2.0;
const CLAHE_TILES: u32 = 8;
const SHARPEN_SIGMA: f32 = 2.0;
const SHARPEN_AMOUNT: f32 = 0.25;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("empty image payload")]
    EmptyInput,
    #[error("undecodable image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Decode raw bytes into an RGB pixel array.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::EmptyInput);
    }
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Prepare an image for detection, returning a new pixel array.
///
/// Upscales so the shorter side reaches [`MIN_SIDE`]. With `enhance`, dim
/// images get CLAHE on luminance and every image gets a mild unsharp mask.
pub fn preprocess(image: &RgbImage, enhance: bool) -> RgbImage {
    let mut out = upscale_small(image);

    if enhance {
        let luminance = mean_luminance(&out);
        if luminance <= LOW_LIGHT_LUMINANCE {
            tracing::debug!(luminance, "low-light image, applying CLAHE");
            equalize_luminance(&mut out);
        }
        out = sharpen(&out);
    }

    out
}

fn upscale_small(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || (w >= MIN_SIDE && h >= MIN_SIDE) {
        return image.clone();
    }
    let scale = MIN_SIDE as f32 / w.min(h) as f32;
    let (new_w, new_h) = if w <= h {
        (MIN_SIDE, ((h as f32 * scale) as u32).max(MIN_SIDE))
    } else {
        (((w as f32 * scale) as u32).max(MIN_SIDE), MIN_SIDE)
    };
    tracing::debug!(w, h, new_w, new_h, "upscaling small image");
    imageops::resize(image, new_w, new_h, FilterType::Lanczos3)
}

/// Mean full-range luma (BT.601) on a 0–255 scale.
pub fn mean_luminance(image: &RgbImage) -> f32 {
    let n = (image.width() as usize) * (image.height() as usize);
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = image
        .pixels()
        .map(|p| luma(p[0], p[1], p[2]) as f64)
        .sum();
    (sum / n as f64) as f32
}

fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// CLAHE on the Y channel of YCbCr; Cb and Cr are carried through untouched.
fn equalize_luminance(image: &mut RgbImage) {
    let (w, h) = image.dimensions();
    let n = (w as usize) * (h as usize);
    let mut y = Vec::with_capacity(n);
    let mut chroma = Vec::with_capacity(n);

    for p in image.pixels() {
        let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
        y.push(luma(p[0], p[1], p[2]).round().clamp(0.0, 255.0) as u8);
        let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
        let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
        chroma.push((cb, cr));
    }

    clahe_enhance(&mut y, w, h, CLAHE_TILES, CLAHE_CLIP_LIMIT);

    for (i, p) in image.pixels_mut().enumerate() {
        let luma = y[i] as f32;
        let (cb, cr) = chroma[i];
        let r = luma + 1.402 * (cr - 128.0);
        let g = luma - 0.344_136 * (cb - 128.0) - 0.714_136 * (cr - 128.0);
        let b = luma + 1.772 * (cb - 128.0);
        p.0 = [to_u8(r), to_u8(g), to_u8(b)];
    }
}

/// Contrast-Limited Adaptive Histogram Equalization, in place.
///
/// `clip_limit` is relative to a uniform histogram: each bin is capped at
/// `clip_limit * tile_pixels / 256`, the excess redistributed evenly. Pixels
/// are mapped by bilinear interpolation between neighbouring tile CDFs.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || gray.len() < w * h {
        return;
    }

    let tx = (tiles as usize).min(w).max(1);
    let ty = (tiles as usize).min(h).max(1);
    let tile_w = w / tx;
    let tile_h = h / ty;
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(tx * ty);
    for row in 0..ty {
        for col in 0..tx {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[gray[y * w + x] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist + u32::from(i < leftover);
            }

            let mut cdf = [0f32; 256];
            let mut running = 0f32;
            for (i, &count) in hist.iter().enumerate() {
                running += count as f32;
                cdf[i] = running;
            }
            let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
            let denom = tile_pixels as f32 - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            } else {
                // Flat tile: identity mapping.
                for (i, v) in cdf.iter_mut().enumerate() {
                    *v = i as f32;
                }
            }
            cdfs.push(cdf);
        }
    }

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (ty - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(ty - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (tx - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tx - 1);
            let dx = fx - c0 as f32;

            let pixel = gray[y * w + x] as usize;
            let top = cdfs[r0 * tx + c0][pixel] * (1.0 - dx) + cdfs[r0 * tx + c1][pixel] * dx;
            let bot = cdfs[r1 * tx + c0][pixel] * (1.0 - dx) + cdfs[r1 * tx + c1][pixel] * dx;
            gray[y * w + x] = to_u8(top * (1.0 - dy) + bot * dy);
        }
    }
}

/// Unsharp mask: `(1 + a) * image - a * blur(image)`.
fn sharpen(image: &RgbImage) -> RgbImage {
    let blurred = imageops::blur(image, SHARPEN_SIGMA);
    let mut out = image.clone();
    for (o, b) in out.pixels_mut().zip(blurred.pixels()) {
        for c in 0..3 {
            let v = (1.0 + SHARPEN_AMOUNT) * o[c] as f32 - SHARPEN_AMOUNT * b[c] as f32;
            o[c] = to_u8(v);
        }
    }
    out
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb};
    use std::io::Cursor;

    fn luminance_stddev(image: &RgbImage) -> f32 {
        let mean = mean_luminance(image);
        let n = (image.width() * image.height()) as f32;
        let var = image
            .pixels()
            .map(|p| (luma(p[0], p[1], p[2]) - mean).powi(2))
            .sum::<f32>()
            / n;
        var.sqrt()
    }

    #[test]
    fn test_decode_empty_is_invalid() {
        assert!(matches!(decode(&[]), Err(PreprocessError::EmptyInput)));
    }

    #[test]
    fn test_decode_garbage_is_invalid() {
        assert!(matches!(decode(b"not an image"), Err(PreprocessError::Decode(_))));
    }

    #[test]
    fn test_decode_png() {
        let img = RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.dimensions(), (8, 4));
        assert_eq!(decoded.get_pixel(3, 2), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_small_image_upscaled_to_min_side() {
        let img = RgbImage::from_pixel(240, 320, Rgb([128, 128, 128]));
        let out = preprocess(&img, false);
        assert_eq!(out.width(), MIN_SIDE);
        assert_eq!(out.height(), 640);
    }

    #[test]
    fn test_wide_small_image_upscaled_on_short_side() {
        let img = RgbImage::from_pixel(1000, 300, Rgb([128, 128, 128]));
        let out = preprocess(&img, false);
        assert_eq!(out.height(), MIN_SIDE);
        assert_eq!(out.width(), 1600);
    }

    #[test]
    fn test_large_image_untouched() {
        let img = RgbImage::from_pixel(640, 480, Rgb([1, 2, 3]));
        let out = preprocess(&img, false);
        assert_eq!(out, img);
    }

    #[test]
    fn test_bright_uniform_image_survives_enhance() {
        let img = RgbImage::from_pixel(480, 480, Rgb([200, 180, 160]));
        let out = preprocess(&img, true);
        // Sharpening a flat field is a no-op; CLAHE is skipped for bright images.
        assert_eq!(out.get_pixel(240, 240), &Rgb([200, 180, 160]));
    }

    #[test]
    fn test_dark_image_gains_contrast() {
        let img = RgbImage::from_fn(480, 480, |x, y| {
            let v = 30 + ((x + y) % 20) as u8;
            Rgb([v, v, v])
        });
        let before = luminance_stddev(&img);
        let mut enhanced = img.clone();
        equalize_luminance(&mut enhanced);
        let after = luminance_stddev(&enhanced);
        assert!(after > before, "CLAHE should increase contrast: {before} -> {after}");
    }

    #[test]
    fn test_equalize_leaves_chroma_neutral() {
        let img = RgbImage::from_fn(64, 64, |x, _| {
            let v = (x * 2) as u8;
            Rgb([v, v, v])
        });
        let mut out = img.clone();
        equalize_luminance(&mut out);
        for p in out.pixels() {
            assert!((p[0] as i32 - p[1] as i32).abs() <= 1);
            assert!((p[1] as i32 - p[2] as i32).abs() <= 1);
        }
    }

    #[test]
    fn test_preprocess_does_not_mutate_input() {
        let img = RgbImage::from_fn(100, 100, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 0]));
        let copy = img.clone();
        let _ = preprocess(&img, true);
        assert_eq!(img, copy);
    }

    #[test]
    fn test_clahe_flat_tile_is_stable() {
        let mut gray = vec![77u8; 64 * 64];
        clahe_enhance(&mut gray, 64, 64, 8, 2.0);
        // Uniform input maps every pixel to the same value.
        assert!(gray.windows(2).all(|w| w[0] == w[1]));
    }
}
