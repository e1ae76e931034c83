//! Derivation of the rotated crop region the landmark network looks at.
//!
//! The palm detector only finds the palm, but the landmark network needs to see the whole hand,
//! upright. The crop region is therefore placed along the wrist → middle finger MCP axis, rotated
//! so that this axis points up in the crop, and scaled to fit the fingers.

use std::f32::consts::{PI, TAU};

use nalgebra::{Matrix3, Point2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};

use crate::{detection::Detection, gpu::RegionRecord, palm::Keypoint};

/// Minimum length of the reference vector for it to define a rotation.
const MIN_REFERENCE_LEN: f32 = 1e-6;

/// Placement of the crop region relative to the palm keypoints.
///
/// The defaults follow MediaPipe's palm to hand ROI transform: the crop is centered half a palm
/// box towards the fingers and scaled by 2.6. They have to match the landmark model in use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiCalibration {
    /// Index of the wrist keypoint.
    pub wrist: usize,
    /// Index of the keypoint the crop's "up" direction points at.
    pub reference: usize,
    /// Position of the crop center along the wrist → reference vector.
    pub center_offset: f32,
    /// Side length of the crop, in multiples of the wrist → reference distance.
    pub size_scale: f32,
}

impl Default for RoiCalibration {
    fn default() -> Self {
        Self {
            wrist: Keypoint::Wrist as usize,
            reference: Keypoint::MiddleFingerMcp as usize,
            center_offset: 1.0,
            size_scale: 2.6,
        }
    }
}

/// A rotated square region in normalized input space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRegion {
    center: Point2<f32>,
    size: f32,
    /// Clockwise (in image coordinates) rotation in radians, 0 when the hand points up.
    rotation: f32,
}

impl CropRegion {
    pub fn new(center: Point2<f32>, size: f32, rotation: f32) -> Self {
        Self {
            center,
            size,
            rotation,
        }
    }

    #[inline]
    pub fn center(&self) -> Point2<f32> {
        self.center
    }

    #[inline]
    pub fn size(&self) -> f32 {
        self.size
    }

    #[inline]
    pub fn rotation(&self) -> f32 {
        self.rotation
    }

    /// Maps crop-local coordinates (`[0, 1]²`, Y pointing down) to normalized input space.
    pub fn transform_out(&self, local: Point2<f32>) -> Point2<f32> {
        let rel = (local - Point2::new(0.5, 0.5)) * self.size;
        self.center + Rotation2::new(self.rotation) * rel
    }

    /// Maps a point in normalized input space to crop-local coordinates.
    ///
    /// Inverse of [`CropRegion::transform_out`].
    pub fn transform_in(&self, p: Point2<f32>) -> Point2<f32> {
        let rel = Rotation2::new(-self.rotation) * (p - self.center) / self.size;
        Point2::new(0.5, 0.5) + rel
    }

    /// Returns the corners of the region in normalized input space, clockwise from the crop's top
    /// left corner.
    pub fn corners(&self) -> [Point2<f32>; 4] {
        [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ]
        .map(|p| self.transform_out(p))
    }

    /// Returns [`CropRegion::transform_out`] as a homogeneous affine matrix.
    pub fn matrix(&self) -> Matrix3<f32> {
        let (sin, cos) = self.rotation.sin_cos();
        let s = self.size;
        let origin = self.transform_out(Point2::origin());
        Matrix3::new(
            cos * s, -sin * s, origin.x, //
            sin * s, cos * s, origin.y, //
            0.0, 0.0, 1.0,
        )
    }

    /// Converts the region to the layout stored in the region buffer.
    ///
    /// `previous` is the region of the last frame, used to fill in the per-frame delta.
    pub fn to_record(&self, previous: Option<&CropRegion>) -> RegionRecord {
        let region = [self.center.x, self.center.y, self.size, self.rotation];
        let delta = match previous {
            Some(prev) => [
                self.center.x - prev.center.x,
                self.center.y - prev.center.y,
                self.size - prev.size,
                wrap_angle(self.rotation - prev.rotation),
            ],
            None => [0.0; 4],
        };

        let m = self.matrix();
        RegionRecord {
            region,
            delta,
            crop_matrix: [
                [m[(0, 0)], m[(1, 0)], 0.0, 0.0],
                [m[(0, 1)], m[(1, 1)], 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [m[(0, 2)], m[(1, 2)], 0.0, 1.0],
            ],
        }
    }
}

/// Computes crop regions from palm detections.
#[derive(Debug, Clone)]
pub struct RoiDeriver {
    calibration: RoiCalibration,
}

impl RoiDeriver {
    pub fn new(calibration: RoiCalibration) -> Self {
        Self { calibration }
    }

    pub fn calibration(&self) -> &RoiCalibration {
        &self.calibration
    }

    /// Derives the crop region for `detection`.
    ///
    /// Returns [`None`] if the wrist and reference keypoints coincide or are not finite, since no
    /// orientation can be derived then.
    pub fn derive(&self, detection: &Detection) -> Option<CropRegion> {
        let cal = &self.calibration;
        let wrist = detection.keypoints()[cal.wrist];
        let reference = detection.keypoints()[cal.reference];

        let v = reference - wrist;
        let len = v.norm();
        if !len.is_finite() || len <= MIN_REFERENCE_LEN {
            return None;
        }

        let rotation = Rotation2::rotation_between(&-Vector2::y(), &v).angle();
        Some(CropRegion {
            center: wrist + v * cal.center_offset,
            size: len * cal.size_scale,
            rotation,
        })
    }
}

/// Smoothing applied to the crop region between frames.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum RoiSmoothing {
    /// Use every derived region as-is.
    #[default]
    None,
    /// Blend each derived region into the previous one with an exponential moving average.
    Ema { weight: f32 },
}

impl RoiSmoothing {
    /// Applies the policy to a freshly derived region.
    pub fn apply(&self, previous: Option<&CropRegion>, region: CropRegion) -> CropRegion {
        let (weight, prev) = match (self, previous) {
            (RoiSmoothing::Ema { weight }, Some(prev)) => (*weight, prev),
            _ => return region,
        };

        let lerp = |a: f32, b: f32| a + (b - a) * weight;
        CropRegion {
            center: Point2::new(
                lerp(prev.center.x, region.center.x),
                lerp(prev.center.y, region.center.y),
            ),
            size: lerp(prev.size, region.size),
            rotation: wrap_angle(
                prev.rotation + wrap_angle(region.rotation - prev.rotation) * weight,
            ),
        }
    }
}

/// Wraps an angle to `(-π, π]`.
fn wrap_angle(angle: f32) -> f32 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped == -PI {
        PI
    } else {
        wrapped
    }
}
