//! Utilities for numerics.

/// Applies the standard sigmoid/logistic function to the input.
pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Inverse of [`sigmoid`]. Useful for turning a desired confidence back into
/// a raw network logit.
pub fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sigmoid_midpoint() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn logit_roundtrip() {
        for p in [0.1, 0.5, 0.75, 0.9] {
            assert_relative_eq!(sigmoid(logit(p)), p, epsilon = 1e-6);
        }
    }
}
