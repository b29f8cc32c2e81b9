//! Fixed-dimension vector values and the normalized cosine distance metric.
//!
//! Distances are mapped onto a `[0, 1]` scale:
//!
//! ```text
//! d(a, b) = (1 - cos(a, b)) / 2
//! ```
//!
//! so identical direction is 0, orthogonal is 0.5 and opposite direction
//! is 1. Magnitude does not matter except for the degenerate case: a
//! zero-magnitude vector has no direction, so it is defined to be maximally
//! distant (1.0) from everything except another zero-magnitude vector
//! (0.0). No distance computation ever produces NaN.

use crate::error::{StorageError, StoreError};

/// An immutable fixed-length vector with declared value bounds.
///
/// The bounds are advisory metadata carried alongside the values; they are
/// stored but never enforced against the components.
#[derive(Debug, Clone)]
pub struct Vector {
    values: Vec<f32>,
    max: f32,
    min: f32,
}

impl Vector {
    pub fn new(values: Vec<f32>, max: f32, min: f32) -> Self {
        Self { values, max, min }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Declared `(max, min)` value bounds.
    pub fn bounds(&self) -> (f32, f32) {
        (self.max, self.min)
    }

    /// Normalized cosine distance in `[0, 1]`.
    ///
    /// Fails with `DimensionMismatch` when the dimensions differ. Zero
    /// magnitude vectors follow the policy documented at module level.
    pub fn distance(&self, other: &Vector) -> Result<f32, StoreError> {
        if self.dim() != other.dim() {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim(),
                actual: other.dim(),
            });
        }

        let mut dot = 0.0f32;
        let mut mag_a = 0.0f32;
        let mut mag_b = 0.0f32;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            mag_a += a * a;
            mag_b += b * b;
        }

        if mag_a == 0.0 || mag_b == 0.0 {
            return Ok(if mag_a == 0.0 && mag_b == 0.0 { 0.0 } else { 1.0 });
        }

        let cosine = dot / (mag_a.sqrt() * mag_b.sqrt());
        // Float drift can push |cosine| a hair past 1; keep the result in range.
        Ok(((1.0 - cosine) / 2.0).clamp(0.0, 1.0))
    }

    /// Exact element-wise equality.
    ///
    /// Fails with `DimensionMismatch` when the dimensions differ.
    pub fn equals(&self, other: &Vector) -> Result<bool, StoreError> {
        if self.dim() != other.dim() {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim(),
                actual: other.dim(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .all(|(a, b)| a == b))
    }

    /// Element-wise arithmetic mean of a member set.
    ///
    /// Returns `None` for an empty set; the bounds are inherited from the
    /// first member. All members are expected to share one dimension.
    pub fn mean(members: &[Vector]) -> Option<Vector> {
        let first = members.first()?;
        let dim = first.dim();
        debug_assert!(members.iter().all(|m| m.dim() == dim));

        let mut sum = vec![0.0f32; dim];
        for member in members {
            for (slot, value) in sum.iter_mut().zip(member.values.iter()) {
                *slot += value;
            }
        }
        let count = members.len() as f32;
        for slot in &mut sum {
            *slot /= count;
        }
        Some(Vector::new(sum, first.max, first.min))
    }

    /// Encode the components to their storable string form (a JSON array).
    pub fn encode(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(&self.values)?)
    }

    /// Decode a stored string form back into a vector with the given bounds.
    pub fn decode(text: &str, max: f32, min: f32) -> Result<Vector, StorageError> {
        let values: Vec<f32> = serde_json::from_str(text)?;
        Ok(Vector::new(values, max, min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec2(x: f32, y: f32) -> Vector {
        Vector::new(vec![x, y], 1.0, -1.0)
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let v = vec2(0.3, -0.7);
        assert!(v.distance(&v).unwrap() < 1e-6);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = vec2(0.9, 0.1);
        let b = vec2(-0.2, 0.5);
        let ab = a.distance(&b).unwrap();
        let ba = b.distance(&a).unwrap();
        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn test_distance_landmarks() {
        let east = vec2(1.0, 0.0);
        let north = vec2(0.0, 1.0);
        let west = vec2(-1.0, 0.0);

        assert!((east.distance(&north).unwrap() - 0.5).abs() < 1e-6);
        assert!((east.distance(&west).unwrap() - 1.0).abs() < 1e-6);
        // Magnitude does not change direction.
        assert!(east.distance(&vec2(42.0, 0.0)).unwrap() < 1e-6);
    }

    #[test]
    fn test_distance_stays_in_unit_range() {
        let pairs = [
            (vec2(0.001, 0.999), vec2(0.002, 0.998)),
            (vec2(1.0, 1.0), vec2(1.0, 1.0)),
            (vec2(-0.5, 0.25), vec2(0.75, -0.3)),
        ];
        for (a, b) in &pairs {
            let d = a.distance(b).unwrap();
            assert!((0.0..=1.0).contains(&d), "distance {} out of range", d);
        }
    }

    #[test]
    fn test_zero_magnitude_policy() {
        let zero = vec2(0.0, 0.0);
        let unit = vec2(1.0, 0.0);

        assert_eq!(zero.distance(&unit).unwrap(), 1.0);
        assert_eq!(unit.distance(&zero).unwrap(), 1.0);
        assert_eq!(zero.distance(&zero).unwrap(), 0.0);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let a = vec2(1.0, 0.0);
        let b = Vector::new(vec![1.0, 0.0, 0.0], 1.0, -1.0);

        assert!(matches!(
            a.distance(&b),
            Err(StoreError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(a.equals(&b).is_err());
    }

    #[test]
    fn test_equals_is_exact() {
        let a = vec2(0.1, 0.2);
        assert!(a.equals(&vec2(0.1, 0.2)).unwrap());
        assert!(!a.equals(&vec2(0.1, 0.2000001)).unwrap());
    }

    #[test]
    fn test_mean() {
        let members = [vec2(1.0, 0.0), vec2(0.0, 1.0)];
        let centroid = Vector::mean(&members).unwrap();
        assert_eq!(centroid.values(), &[0.5, 0.5]);

        assert!(Vector::mean(&[]).is_none());
    }

    #[test]
    fn test_codec_roundtrip() {
        let v = vec2(0.25, -0.75);
        let text = v.encode().unwrap();
        let back = Vector::decode(&text, 1.0, -1.0).unwrap();
        assert!(v.equals(&back).unwrap());
    }
}
