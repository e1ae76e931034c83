//! Non-Maximum Suppression and Averaging.
//!
//! Single-Shot MultiBox Detectors (SSD) produce duplicate detections for individual objects.
//! Non-Maximum Suppression (NMS) filters these duplicates out, leaving only a single detection with
//! high confidence for each object.
//!
//! This module implements 2 variants of NMS, selected with [`SuppressionMode`]: The classic
//! Non-Maximum Suppression algorithm that removes any less confident detections
//! ([`SuppressionMode::Remove`]), and Non-Maximum Averaging ([`SuppressionMode::Average`]) which
//! instead computes a weighted average of overlapping detections. Averaging reduces jitter between
//! frames, but the averaged boxes are no longer guaranteed to overlap each other by at most the IoU
//! threshold, so removal is the default.

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::{num::TotalF32, rect::Rect};

use super::{Detection, KEYPOINT_COUNT};

/// A non-maximum suppression algorithm.
pub struct NonMaxSuppression {
    iou_thresh: f32,
    avg_buf: Vec<Detection>,
    out_buf: Vec<Detection>,
    mode: SuppressionMode,
}

impl NonMaxSuppression {
    /// The default intersection-over-union threshold used to determine if two detections overlap.
    pub const DEFAULT_IOU_THRESH: f32 = 0.3;

    /// Creates a new non-maximum suppressor using [`SuppressionMode::Remove`] and a default IoU
    /// threshold.
    pub fn new() -> Self {
        Self {
            iou_thresh: Self::DEFAULT_IOU_THRESH,
            avg_buf: Vec::new(),
            out_buf: Vec::new(),
            mode: SuppressionMode::Remove,
        }
    }

    /// Sets the intersection-over-union threshold to consider two detections as overlapping.
    ///
    /// A detection is suppressed when its IoU with a more confident detection is strictly greater
    /// than this threshold.
    pub fn set_iou_thresh(&mut self, iou_thresh: f32) {
        self.iou_thresh = iou_thresh;
    }

    pub fn iou_thresh(&self) -> f32 {
        self.iou_thresh
    }

    /// Sets the suppression mode.
    pub fn set_mode(&mut self, mode: SuppressionMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> SuppressionMode {
        self.mode
    }

    /// Suppresses overlapping detections, yielding the survivors in descending score order.
    ///
    /// `detections` is left empty.
    pub fn process(
        &mut self,
        detections: &mut Vec<Detection>,
    ) -> impl Iterator<Item = Detection> + '_ {
        self.out_buf.clear();

        // Sort by ascending score, process highest score first by starting at the back.
        detections.sort_unstable_by_key(|det| TotalF32(det.score()));

        while let Some(seed) = detections.pop() {
            let overlaps = |other: &Detection| seed.rect().iou(&other.rect()) > self.iou_thresh;

            match self.mode {
                SuppressionMode::Remove => {
                    detections.retain(|other| !overlaps(other));
                    self.out_buf.push(seed);
                }
                SuppressionMode::Average => {
                    self.avg_buf.clear();
                    self.avg_buf.push(seed.clone());
                    detections.retain(|other| {
                        if overlaps(other) {
                            self.avg_buf.push(other.clone());
                            false
                        } else {
                            true
                        }
                    });

                    self.out_buf.push(weighted_average(seed.score(), &self.avg_buf));
                }
            }
        }

        self.avg_buf.clear();
        self.out_buf.drain(..)
    }
}

impl Default for NonMaxSuppression {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the score-weighted average of `group`, keeping the score of the seed.
fn weighted_average(score: f32, group: &[Detection]) -> Detection {
    let mut center = Vector2::zeros();
    let mut size = Vector2::zeros();
    let mut keypoints = [Vector2::zeros(); KEYPOINT_COUNT];
    let mut divisor = 0.0;
    for det in group {
        let factor = det.score();
        divisor += factor;
        let rect = det.rect();
        center += rect.center().coords * factor;
        size += Vector2::new(rect.width(), rect.height()) * factor;
        for (acc, kp) in keypoints.iter_mut().zip(det.keypoints()) {
            *acc += kp.coords * factor;
        }
    }

    center /= divisor;
    size /= divisor;
    Detection::new(
        score,
        Rect::from_center(center.x, center.y, size.x, size.y),
        keypoints.map(|kp| Point2::from(kp / divisor)),
    )
}

/// Describes how [`NonMaxSuppression`] should deal with overlapping detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SuppressionMode {
    /// Remove overlapping detections, only retain the detection with highest confidence score.
    #[default]
    Remove,

    /// Compute a confidence-weighted average of overlapping detections.
    Average,
}
