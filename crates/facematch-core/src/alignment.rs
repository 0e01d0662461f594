//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps five detected landmarks onto the ArcFace reference layout with a
//! closed-form least-squares fit, then warps the RGB face into a square crop.

use crate::types::Landmarks;
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] · src + (tx, ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit from `src` to `dst`. Returns `None` when the source
    /// points are coincident.
    pub fn estimate(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        let n = src.len() as f32;
        let centroid = |pts: &Landmarks| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (scx, scy) = centroid(src);
        let (dcx, dcy) = centroid(dst);

        let (mut dot, mut cross, mut var) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - scx, sy - scy);
            let (dx, dy) = (dx - dcx, dy - dcy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            var += sx * sx + sy * sy;
        }
        if var < 1e-12 {
            return None;
        }

        let a = dot / var;
        let b = cross / var;
        Some(Self {
            a,
            b,
            tx: dcx - (a * scx - b * scy),
            ty: dcy - (b * scx + a * scy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Map an output coordinate back into the source image.
    fn invert(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Bilinear sample; pixels outside the image read as black.
fn sample(image: &RgbImage, sx: f32, sy: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let at = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            image.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    Rgb(std::array::from_fn(|c| {
        let v = at(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
            + at(x0 + 1, y0, c) * fx * (1.0 - fy)
            + at(x0, y0 + 1, c) * (1.0 - fx) * fy
            + at(x0 + 1, y0 + 1, c) * fx * fy;
        v.round().clamp(0.0, 255.0) as u8
    }))
}

/// Warp `image` through `transform` into a `size × size` crop.
pub fn warp(image: &RgbImage, transform: &Similarity, size: u32) -> RgbImage {
    RgbImage::from_fn(size, size, |ox, oy| {
        transform
            .invert((ox as f32, oy as f32))
            .map(|(sx, sy)| sample(image, sx, sy))
            .unwrap_or(Rgb([0, 0, 0]))
    })
}

/// Align a face to the canonical 112×112 ArcFace crop. Returns `None` for
/// degenerate landmarks.
pub fn align_face(image: &RgbImage, landmarks: &Landmarks) -> Option<RgbImage> {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112)?;
    Some(warp(image, &transform, ALIGNED_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_fit() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_half_scale_fit() {
        let src: Landmarks = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS_112[i];
            (x * 2.0 + 10.0, y * 2.0 + 20.0)
        });
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        let (x, y) = t.apply(src[2]);
        assert!((x - REFERENCE_LANDMARKS_112[2].0).abs() < 1e-3);
        assert!((y - REFERENCE_LANDMARKS_112[2].1).abs() < 1e-3);
    }

    #[test]
    fn test_rotation_fit() {
        // 90° rotation about the origin: (x, y) → (-y, x).
        let dst: Landmarks = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS_112[i];
            (-y, x)
        });
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &dst).unwrap();
        assert!(t.a.abs() < 1e-4);
        assert!((t.b - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_coincident_landmarks_rejected() {
        assert!(Similarity::estimate(&[(5.0, 5.0); 5], &REFERENCE_LANDMARKS_112).is_none());
        assert!(align_face(&RgbImage::new(10, 10), &[(5.0, 5.0); 5]).is_none());
    }

    #[test]
    fn test_align_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([128, 64, 32]));
        let aligned = align_face(&image, &REFERENCE_LANDMARKS_112).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(*aligned.get_pixel(56, 56), Rgb([128, 64, 32]));
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut image = RgbImage::new(200, 200);
        let src: Landmarks = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        for dy in 0..5 {
            for dx in 0..5 {
                image.put_pixel(78 + dx, 58 + dy, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&image, &src).unwrap();
        let rx = REFERENCE_LANDMARKS_112[0].0.round() as u32;
        let ry = REFERENCE_LANDMARKS_112[0].1.round() as u32;
        let mut brightest = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                brightest = brightest.max(aligned.get_pixel(x, y)[0]);
            }
        }
        assert!(brightest > 100, "red patch should map near the left-eye reference, got {brightest}");
        assert_eq!(aligned.get_pixel(rx, ry)[2], 0);
    }

    #[test]
    fn test_outside_source_is_black() {
        let image = RgbImage::from_pixel(10, 10, Rgb([200, 200, 200]));
        let shift = Similarity { a: 1.0, b: 0.0, tx: 50.0, ty: 50.0 };
        let out = warp(&image, &shift, 20);
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 0, 0]));
    }
}
