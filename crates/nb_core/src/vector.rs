use crate::{Error, Result};

/// Dot product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity between two unit-normalized vectors is just their dot
/// product; callers comparing raw vectors should normalize first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

/// Unit-normalize a vector. Zero-norm input is an error: an all-zero
/// embedding carries no semantic signal and would poison every similarity
/// comparison downstream.
pub fn normalize(v: &[f32]) -> Result<Vec<f32>> {
    let norm = dot(v, v).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(Error::Clustering("cannot normalize zero or non-finite vector".to_string()));
    }
    Ok(v.iter().map(|x| x / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_unnormalized_inputs() {
        let a = vec![3.0, 0.0];
        let b = vec![7.5, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize() {
        let v = normalize(&[3.0, 4.0]).unwrap();
        assert!((dot(&v, &v).sqrt() - 1.0).abs() < 1e-6);
        assert!(normalize(&[0.0, 0.0]).is_err());
    }
}
