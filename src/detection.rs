//! Palm detections and the post-processing shared by SSD-style detectors.

pub mod nms;
pub mod ssd;

use nalgebra::Point2;

use crate::{gpu::DetectionRecord, rect::Rect};

/// Number of keypoints every palm detection carries.
pub const KEYPOINT_COUNT: usize = 7;

/// A detected palm.
///
/// A [`Detection`] consists of an axis-aligned bounding [`Rect`], a fixed set of keypoints, and a
/// confidence score in `[0, 1]`. Everything is in normalized input space.
///
/// The score is used as a weight by [`nms::SuppressionMode::Average`], so it has to have the
/// expected range when making use of that.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    score: f32,
    rect: Rect,
    keypoints: [Point2<f32>; KEYPOINT_COUNT],
}

impl Detection {
    pub fn new(score: f32, rect: Rect, keypoints: [Point2<f32>; KEYPOINT_COUNT]) -> Self {
        Self {
            score,
            rect,
            keypoints,
        }
    }

    #[inline]
    pub fn score(&self) -> f32 {
        self.score
    }

    #[inline]
    pub fn rect(&self) -> Rect {
        self.rect
    }

    #[inline]
    pub fn keypoints(&self) -> &[Point2<f32>; KEYPOINT_COUNT] {
        &self.keypoints
    }

    /// Converts this detection to the layout stored in the detection buffer.
    pub fn to_record(&self) -> DetectionRecord {
        DetectionRecord {
            center: [self.rect.x_center(), self.rect.y_center()],
            extent: [self.rect.width(), self.rect.height()],
            keypoints: self.keypoints.map(|p| [p.x, p.y]),
            score: self.score,
            _pad: [0.0; 5],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_contents() {
        let mut keypoints = [Point2::origin(); KEYPOINT_COUNT];
        keypoints[2] = Point2::new(0.25, 0.75);
        let det = Detection::new(0.8, Rect::from_center(0.5, 0.4, 0.2, 0.1), keypoints);

        let record = det.to_record();
        assert_eq!(record.center, [0.5, 0.4]);
        assert_eq!(record.extent, [0.2, 0.1]);
        assert_eq!(record.keypoints[2], [0.25, 0.75]);
        assert_eq!(record.score, 0.8);
    }
}
