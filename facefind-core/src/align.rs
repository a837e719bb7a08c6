use crate::detect::Keypoints;
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("Degenerate keypoints, cannot estimate transform")]
    Degenerate,
}

/// Side of the aligned face crop fed to the embedder
pub const ALIGNED_SIZE: u32 = 112;

/// ArcFace reference keypoints for a 112x112 crop
pub const REFERENCE_KEYPOINTS: Keypoints = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `[a, b, tx, ty]`: u = a·x − b·y + tx, v = b·x + a·y + ty
pub type Similarity = [f32; 4];

/// Warp the face described by `keypoints` onto the reference layout
pub fn align_face(image: &RgbImage, keypoints: &Keypoints) -> Result<RgbImage, AlignmentError> {
    let [a, b, tx, ty] = estimate_similarity(keypoints, &REFERENCE_KEYPOINTS)?;
    let projection = Projection::from_matrix([a, -b, tx, b, a, ty, 0.0, 0.0, 1.0])
        .ok_or(AlignmentError::Degenerate)?;

    let mut aligned = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    warp_into(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut aligned);
    Ok(aligned)
}

/// Least-squares similarity transform mapping `src` onto `dst`
pub fn estimate_similarity(src: &Keypoints, dst: &Keypoints) -> Result<Similarity, AlignmentError> {
    let n = src.len() as f64;
    let centroid = |pts: &Keypoints| {
        let (sx, sy) = pts
            .iter()
            .fold((0.0f64, 0.0f64), |(ax, ay), &(x, y)| (ax + x as f64, ay + y as f64));
        (sx / n, sy / n)
    };
    let (mx, my) = centroid(src);
    let (mu, mv) = centroid(dst);

    // Centered sums: a = Σ(x·u + y·v) / Σ|p|², b = Σ(x·v − y·u) / Σ|p|²
    let (mut dot, mut cross, mut norm) = (0.0f64, 0.0f64, 0.0f64);
    for (&(x, y), &(u, v)) in src.iter().zip(dst.iter()) {
        let (x, y) = (x as f64 - mx, y as f64 - my);
        let (u, v) = (u as f64 - mu, v as f64 - mv);
        dot += x * u + y * v;
        cross += x * v - y * u;
        norm += x * x + y * y;
    }

    if norm < 1e-9 {
        return Err(AlignmentError::Degenerate);
    }

    let a = dot / norm;
    let b = cross / norm;
    let tx = mu - (a * mx - b * my);
    let ty = mv - (b * mx + a * my);

    Ok([a as f32, b as f32, tx as f32, ty as f32])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(t: &Similarity, (x, y): (f32, f32)) -> (f32, f32) {
        let [a, b, tx, ty] = *t;
        (a * x - b * y + tx, b * x + a * y + ty)
    }

    #[test]
    fn test_identity() {
        let t = estimate_similarity(&REFERENCE_KEYPOINTS, &REFERENCE_KEYPOINTS).unwrap();
        assert!((t[0] - 1.0).abs() < 1e-4);
        assert!(t[1].abs() < 1e-4);
        assert!(t[2].abs() < 1e-3);
        assert!(t[3].abs() < 1e-3);
    }

    #[test]
    fn test_scaled_and_shifted() {
        let mut src = REFERENCE_KEYPOINTS;
        for p in &mut src {
            *p = (p.0 * 2.0 + 10.0, p.1 * 2.0 + 20.0);
        }
        let t = estimate_similarity(&src, &REFERENCE_KEYPOINTS).unwrap();
        assert!((t[0] - 0.5).abs() < 1e-4);
        assert!(t[1].abs() < 1e-4);

        for (s, d) in src.iter().zip(REFERENCE_KEYPOINTS.iter()) {
            let (u, v) = apply(&t, *s);
            assert!((u - d.0).abs() < 1e-2 && (v - d.1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_degenerate_keypoints() {
        let src = [(5.0, 5.0); 5];
        assert!(matches!(
            estimate_similarity(&src, &REFERENCE_KEYPOINTS),
            Err(AlignmentError::Degenerate)
        ));
    }

    #[test]
    fn test_align_output_size() {
        let image = RgbImage::from_pixel(200, 200, Rgb([120, 80, 40]));
        let aligned = align_face(&image, &REFERENCE_KEYPOINTS).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([120, 80, 40]));
    }
}
