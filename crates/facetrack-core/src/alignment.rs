//! Geometric helpers for getting face crops in front of the models.
//!
//! Landmark alignment uses a 4-DOF similarity transform (scale, rotation,
//! translation) fitted in closed form to the five reference points; the
//! attribute models take a square crop around the box instead.

use crate::frame::Frame;
use crate::types::BoundingBox;

/// Canonical five-point landmark positions for a 112x112 crop.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Maps `(x, y)` to `(a*x - b*y + tx, b*x + a*y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Option<Similarity> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Similarity {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Least-squares similarity from `src` onto `dst`.
pub fn similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        (sx / n, sy / n)
    };
    let (msx, msy) = mean(src);
    let (mdx, mdy) = mean(dst);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut norm = 0.0f32;
    for (s, d) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (s.0 - msx, s.1 - msy);
        let (dx, dy) = (d.0 - mdx, d.1 - mdy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        norm += sx * sx + sy * sy;
    }

    if norm < 1e-12 {
        return Similarity {
            a: 1.0,
            b: 0.0,
            tx: mdx - msx,
            ty: mdy - msy,
        };
    }

    let a = dot / norm;
    let b = cross / norm;
    Similarity {
        a,
        b,
        tx: mdx - (a * msx - b * msy),
        ty: mdy - (b * msx + a * msy),
    }
}

/// Render an `out_w` x `out_h` image whose pixel `(x, y)` samples the frame at
/// `to_source(x, y)`. Samples outside the frame are black.
fn warp(frame: &Frame, out_w: usize, out_h: usize, to_source: impl Fn(f32, f32) -> (f32, f32)) -> Vec<u8> {
    let mut out = vec![0u8; out_w * out_h];
    for oy in 0..out_h {
        for ox in 0..out_w {
            let (sx, sy) = to_source(ox as f32, oy as f32);
            out[oy * out_w + ox] = sample_bilinear(frame, sx, sy);
        }
    }
    out
}

fn sample_bilinear(frame: &Frame, sx: f32, sy: f32) -> u8 {
    let (w, h) = (frame.width as i64, frame.height as i64);
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let px = |x: i64, y: i64| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            frame.data[(y * w + x) as usize] as f32
        } else {
            0.0
        }
    };

    let top = px(x0, y0) * (1.0 - fx) + px(x0 + 1, y0) * fx;
    let bottom = px(x0, y0 + 1) * (1.0 - fx) + px(x0 + 1, y0 + 1) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}

/// Warp the face so its landmarks land on the reference positions of a
/// `size` x `size` crop.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5], size: usize) -> Vec<u8> {
    let k = size as f32 / 112.0;
    let reference = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * k, y * k));
    let forward = similarity_transform(landmarks, &reference);
    match forward.inverse() {
        Some(inv) => warp(frame, size, size, |x, y| inv.apply((x, y))),
        None => vec![0u8; size * size],
    }
}

/// Square crop of side `max(w, h) * scale` centred on `bbox`, resampled to
/// `size` x `size`.
pub fn crop_square(frame: &Frame, bbox: &BoundingBox, scale: f32, size: usize) -> Vec<u8> {
    let side = bbox.width.max(bbox.height) * scale;
    let cx = bbox.x + bbox.width / 2.0;
    let cy = bbox.y + bbox.height / 2.0;
    let step = side / size as f32;
    let x0 = cx - side / 2.0;
    let y0 = cy - side / 2.0;
    warp(frame, size, size, |x, y| {
        (x0 + (x + 0.5) * step - 0.5, y0 + (y + 0.5) * step - 0.5)
    })
}

/// Bilinear resize of a whole frame.
pub fn resize(frame: &Frame, out_w: usize, out_h: usize) -> Vec<u8> {
    let sx = frame.width as f32 / out_w as f32;
    let sy = frame.height as f32 / out_h as f32;
    let (max_x, max_y) = (frame.width as f32 - 1.0, frame.height as f32 - 1.0);
    warp(frame, out_w, out_h, |x, y| {
        (
            ((x + 0.5) * sx - 0.5).clamp(0.0, max_x),
            ((y + 0.5) * sy - 0.5).clamp(0.0, max_y),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: u32, h: u32, fill: u8) -> Frame {
        Frame::new(vec![fill; (w * h) as usize], w, h, 0).unwrap()
    }

    #[test]
    fn test_identity_transform() {
        let t = similarity_transform(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_recovers_scale_and_shift() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 30.0, y * 2.0 + 10.0));
        let t = similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        let (x, y) = t.apply(src[2]);
        assert!((x - REFERENCE_LANDMARKS_112[2].0).abs() < 1e-3);
        assert!((y - REFERENCE_LANDMARKS_112[2].1).abs() < 1e-3);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Similarity {
            a: 0.8,
            b: 0.3,
            tx: 12.0,
            ty: -4.0,
        };
        let inv = t.inverse().unwrap();
        let (x, y) = inv.apply(t.apply((17.0, 42.0)));
        assert!((x - 17.0).abs() < 1e-3 && (y - 42.0).abs() < 1e-3);
    }

    #[test]
    fn test_landmark_patch_lands_on_reference() {
        let (w, h) = (200usize, 200usize);
        let mut data = vec![0u8; w * h];
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for dy in 0..5 {
            for dx in 0..5 {
                data[(58 + dy) * w + 78 + dx] = 255;
            }
        }
        let frame = Frame::new(data, w as u32, h as u32, 0).unwrap();
        let aligned = align_face(&frame, &src, 112);
        assert_eq!(aligned.len(), 112 * 112);

        let (rx, ry) = (38usize, 52usize);
        let peak = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned[y * 112 + x])
            .max()
            .unwrap();
        assert!(peak > 100, "peak near reference left eye was {peak}");
    }

    #[test]
    fn test_crop_square_size_and_fill() {
        let crop = crop_square(&frame(64, 64, 90), &BoundingBox::new(16.0, 16.0, 32.0, 32.0), 1.0, 24);
        assert_eq!(crop.len(), 24 * 24);
        assert!(crop.iter().all(|&p| p == 90));
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let out = resize(&frame(100, 80, 128), 200, 160);
        assert_eq!(out.len(), 200 * 160);
        assert!(out.iter().all(|&p| p == 128));
    }
}
