//! Pipeline configuration.

use std::{fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    detection::{nms::SuppressionMode, KEYPOINT_COUNT},
    error::Error,
    roi::{RoiCalibration, RoiSmoothing},
};

/// Configuration of a [`HandPipeline`](crate::pipeline::HandPipeline).
///
/// Missing fields take their default values when deserializing, so a configuration file only has
/// to list what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Side length of the palm detection network's square input.
    pub input_size: u32,
    /// Side length of the landmark network's square input.
    pub crop_size: u32,
    /// Number of landmarks the landmark network outputs per hand.
    pub vertex_count: u32,
    /// Capacity of the detection buffer.
    pub max_detections: u32,
    /// Palm detections scoring below this are discarded.
    pub score_threshold: f32,
    /// Maximum IoU two retained palm detections may have.
    pub iou_threshold: f32,
    pub suppression: SuppressionMode,
    /// Weight of new samples in the landmark filter. Lower is smoother, but lags more.
    pub filter_weight: f32,
    /// Number of consecutive frames without a hand after which the landmark filter is reset.
    pub lost_frame_threshold: u32,
    /// Landmark passes with a lower presence score are treated as if no hand was found.
    pub presence_threshold: f32,
    pub roi: RoiCalibration,
    pub roi_smoothing: RoiSmoothing,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_size: 192,
            crop_size: 224,
            vertex_count: 21,
            max_detections: 64,
            score_threshold: 0.5,
            iou_threshold: 0.3,
            suppression: SuppressionMode::Remove,
            filter_weight: 0.5,
            lost_frame_threshold: 5,
            presence_threshold: 0.5,
            roi: RoiCalibration::default(),
            roi_smoothing: RoiSmoothing::None,
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// The loaded configuration is not validated; [`HandPipeline::new`] does that.
    ///
    /// [`HandPipeline::new`]: crate::pipeline::HandPipeline::new
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Checks that all values are within their allowed ranges.
    pub fn validate(&self) -> Result<(), Error> {
        fn unit(name: &str, value: f32) -> Result<(), Error> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(Error::config(format!("`{name}` must be in [0, 1], got {value}")))
            }
        }

        if self.input_size == 0 || self.crop_size == 0 || self.vertex_count == 0 {
            return Err(Error::config(
                "`input_size`, `crop_size` and `vertex_count` must be non-zero",
            ));
        }
        if self.max_detections == 0 {
            return Err(Error::config("`max_detections` must be non-zero"));
        }
        unit("score_threshold", self.score_threshold)?;
        unit("iou_threshold", self.iou_threshold)?;
        unit("filter_weight", self.filter_weight)?;
        unit("presence_threshold", self.presence_threshold)?;
        if let RoiSmoothing::Ema { weight } = self.roi_smoothing {
            unit("roi_smoothing.weight", weight)?;
        }

        let roi = &self.roi;
        if roi.wrist >= KEYPOINT_COUNT || roi.reference >= KEYPOINT_COUNT {
            return Err(Error::config(format!(
                "ROI keypoint indices must be below {KEYPOINT_COUNT}, got {} and {}",
                roi.wrist, roi.reference,
            )));
        }
        if roi.wrist == roi.reference {
            return Err(Error::config("ROI keypoints must be distinct"));
        }
        if !roi.center_offset.is_finite() || !(roi.size_scale.is_finite() && roi.size_scale > 0.0)
        {
            return Err(Error::config(format!(
                "ROI calibration must be finite with a positive scale, got offset {} and scale {}",
                roi.center_offset, roi.size_scale,
            )));
        }

        Ok(())
    }
}
