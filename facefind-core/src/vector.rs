/// Compute cosine similarity between two face descriptors
///
/// Total over all inputs: empty slices, mismatched lengths, non-finite
/// elements and zero-norm vectors all score 0.0 instead of failing.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        if !x.is_finite() || !y.is_finite() {
            return 0.0;
        }
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0) as f32
}

/// Check that a descriptor can be compared against one of `dim` elements
pub fn is_usable(descriptor: &[f32], dim: usize) -> bool {
    !descriptor.is_empty() && descriptor.len() == dim && descriptor.iter().all(|v| v.is_finite())
}

/// L2 normalize a descriptor in place; zero vectors are left untouched
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values
        .iter()
        .map(|&v| (v as f64) * (v as f64))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 && norm.is_finite() {
        for v in values.iter_mut() {
            *v = (*v as f64 / norm) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_identical() {
        let a = [0.3, -1.2, 4.0, 0.01];
        assert!((similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal_and_opposite() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert!(similarity(&a, &b).abs() < 1e-6);

        let c = [-1.0, 0.0, 0.0];
        assert!((similarity(&a, &c) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_scale_invariant() {
        let a = [1.0, 2.0, 3.0];
        let b = [10.0, 20.0, 30.0];
        assert!((similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_length_mismatch() {
        assert_eq!(similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(similarity(&[], &[]), 0.0);
        assert_eq!(similarity(&[1.0], &[]), 0.0);
    }

    #[test]
    fn test_similarity_non_finite() {
        let a = [1.0, f32::NAN, 0.0];
        let b = [1.0, 0.0, 0.0];
        assert_eq!(similarity(&a, &b), 0.0);
        assert_eq!(similarity(&b, &[f32::INFINITY, 0.0, 0.0]), 0.0);
        assert_eq!(similarity(&[f32::NEG_INFINITY], &[1.0]), 0.0);
    }

    #[test]
    fn test_similarity_zero_norm() {
        assert_eq!(similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_is_usable() {
        assert!(is_usable(&[0.1, 0.2], 2));
        assert!(!is_usable(&[0.1, 0.2], 3));
        assert!(!is_usable(&[], 0));
        assert!(!is_usable(&[0.1, f32::NAN], 2));
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = [3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = [0.0; 4];
        l2_normalize(&mut zero);
        assert!(zero.iter().all(|&x| x == 0.0));
    }
}
