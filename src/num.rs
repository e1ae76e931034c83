//! Utilities for numerics.

use std::cmp::Ordering;

/// Logits are clamped to this magnitude before applying [`sigmoid`] to raw network scores.
pub const SCORE_CLIPPING_THRESH: f32 = 100.0;

/// Applies the standard sigmoid/logistic function to the input.
pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Applies [`sigmoid`] to a raw network score after clamping it to
/// [`SCORE_CLIPPING_THRESH`].
pub fn score_from_logit(logit: f32) -> f32 {
    sigmoid(logit.clamp(-SCORE_CLIPPING_THRESH, SCORE_CLIPPING_THRESH))
}

/// An `f32` that implements [`Ord`] according to the IEEE 754 totalOrder predicate.
#[derive(Debug, Clone, Copy)]
pub struct TotalF32(pub f32);

impl PartialEq for TotalF32 {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TotalF32 {}

impl PartialOrd for TotalF32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF32 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_midpoint() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    #[test]
    fn clipped_logits_stay_finite() {
        assert!(score_from_logit(f32::MAX).is_finite());
        assert!(score_from_logit(f32::MIN) >= 0.0);
        assert_eq!(score_from_logit(1000.0), score_from_logit(SCORE_CLIPPING_THRESH));
    }

    #[test]
    fn total_order_sorts_descending() {
        let mut v = vec![TotalF32(0.2), TotalF32(0.9), TotalF32(-1.0)];
        v.sort_by(|a, b| b.cmp(a));
        assert_eq!(v.iter().map(|t| t.0).collect::<Vec<_>>(), [0.9, 0.2, -1.0]);
    }
}
