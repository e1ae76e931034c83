//! Palm detection.
//!
//! The [`PalmDetector`] letterboxes a frame into the palm network's square input, runs the network
//! through a [`PalmModel`], decodes the per-anchor outputs into [`Detection`]s and suppresses
//! duplicates. Survivors are uploaded to a GPU detection buffer, and their count to a GPU count
//! slot that can be copied into indirect draw arguments without reading it back.

use std::mem;

use anyhow::bail;
use nalgebra::Point2;
use pawawwewism::{promise, Promise, PromiseHandle, Worker};

use crate::{
    config::PipelineConfig,
    detection::{
        nms::NonMaxSuppression,
        ssd::{Anchor, Anchors, LayerInfo},
        Detection, KEYPOINT_COUNT,
    },
    error::Error,
    gpu::{staging_vec, AllocError, Buffer, BufferKind, DetectionRecord, Device, DrawIndirectArgs},
    image::Image,
    nn::CnnInputShape,
    num::score_from_logit,
    rect::Rect,
    resolution::Letterbox,
    timer::Timer,
};

/// Number of values the network outputs per anchor: box center, box size and 7 keypoints.
pub const BOX_PARAMS: usize = 4 + 2 * KEYPOINT_COUNT;

/// A keypoint of a palm [`Detection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keypoint {
    Wrist = 0,
    IndexFingerMcp = 1,
    MiddleFingerMcp = 2,
    RingFingerMcp = 3,
    PinkyMcp = 4,
    ThumbCmc = 5,
    ThumbMcp = 6,
}

/// A list of all [`Keypoint`]s.
pub const ALL_KEYPOINTS: &[Keypoint] = &[
    Keypoint::Wrist,
    Keypoint::IndexFingerMcp,
    Keypoint::MiddleFingerMcp,
    Keypoint::RingFingerMcp,
    Keypoint::PinkyMcp,
    Keypoint::ThumbCmc,
    Keypoint::ThumbMcp,
];

/// Raw outputs of a palm detection network.
#[derive(Debug, Clone, Default)]
pub struct RawPalmOutput {
    /// [`BOX_PARAMS`] values per anchor, in input pixels. Box centers and keypoints are relative to
    /// the anchor center.
    pub boxes: Vec<f32>,
    /// One score logit per anchor.
    pub scores: Vec<f32>,
}

/// Inference backend for palm detection.
pub trait PalmModel {
    /// Side length of the square input tensor.
    fn input_size(&self) -> u32;

    fn input_layout(&self) -> CnnInputShape {
        CnnInputShape::NCHW
    }

    /// SSD output layers of the network. Defaults to the layout of MediaPipe's palm models.
    fn anchor_layers(&self) -> Vec<LayerInfo> {
        vec![LayerInfo::new(2, 24, 24), LayerInfo::new(6, 12, 12)]
    }

    /// Runs the network on an RGB input tensor with values in `[0, 1]`.
    fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawPalmOutput>;
}

impl<M: PalmModel + ?Sized> PalmModel for Box<M> {
    fn input_size(&self) -> u32 {
        (**self).input_size()
    }

    fn input_layout(&self) -> CnnInputShape {
        (**self).input_layout()
    }

    fn anchor_layers(&self) -> Vec<LayerInfo> {
        (**self).anchor_layers()
    }

    fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawPalmOutput> {
        (**self).infer(input)
    }
}

/// Result of one inference pass, along with the input tensor for reuse.
type PalmPass = (Vec<f32>, anyhow::Result<RawPalmOutput>);

/// Detects palms and keeps the results in GPU buffers.
///
/// The network runs on a dedicated worker thread. [`PalmDetector::submit`] samples the frame and
/// hands it to the worker without waiting, and [`PalmDetector::collect`] picks up the result.
pub struct PalmDetector<D: Device> {
    worker: Worker<(Vec<f32>, Promise<PalmPass>)>,
    pending: Option<PromiseHandle<PalmPass>>,
    input_size: u32,
    layout: CnnInputShape,
    anchors: Anchors,
    nms: NonMaxSuppression,
    score_threshold: f32,
    capacity: usize,
    tensor_len: usize,
    /// Staging tensor. Lent to the worker while a pass is in flight.
    tensor: Vec<f32>,
    candidates: Vec<Detection>,
    detections: Vec<Detection>,
    records: Vec<DetectionRecord>,
    input_buffer: Buffer<D, f32>,
    detection_buffer: Buffer<D, DetectionRecord>,
    count_buffer: Buffer<D, u32>,
    t_sample: Timer,
    t_wait: Timer,
    t_decode: Timer,
    t_nms: Timer,
}

impl<D: Device> PalmDetector<D> {
    /// Creates a palm detector, allocating its buffers on `device` and starting its worker.
    ///
    /// Fails with [`Error::Config`] if the model's input size does not match `config`. The
    /// detection capacity is `max_detections`, limited to the number of anchors of the model.
    pub fn new(
        device: &D,
        mut model: Box<dyn PalmModel + Send>,
        config: &PipelineConfig,
    ) -> Result<Self, Error> {
        let input_size = model.input_size();
        if input_size != config.input_size {
            return Err(Error::config(format!(
                "palm model takes {0}x{0} inputs, but `input_size` is {1}",
                input_size, config.input_size,
            )));
        }

        let anchors = Anchors::calculate(&model.anchor_layers());
        if anchors.anchor_count() == 0 {
            return Err(Error::config("palm model has no anchors"));
        }
        let capacity = (config.max_detections as usize).min(anchors.anchor_count());
        if capacity < config.max_detections as usize {
            log::debug!(
                "limiting palm detection capacity to the model's {} anchors",
                capacity,
            );
        }

        let mut nms = NonMaxSuppression::new();
        nms.set_iou_thresh(config.iou_threshold);
        nms.set_mode(config.suppression);

        let tensor_len = tensor_len(input_size)
            .ok_or_else(|| Error::config(format!("palm input size {input_size} is too large")))?;
        let input_buffer = Buffer::new(device, "palm_input", tensor_len, BufferKind::Storage)?;
        let detection_buffer =
            Buffer::new(device, "palm_detections", capacity, BufferKind::Storage)?;
        let count_buffer = Buffer::new(device, "palm_detection_count", 1, BufferKind::Storage)?;
        let tensor = staging_vec("palm_input", tensor_len)?;
        let mut records = Vec::new();
        records
            .try_reserve_exact(capacity)
            .map_err(|e| AllocError {
                label: "palm_detections".into(),
                size: detection_buffer.size_bytes(),
                reason: e.to_string(),
            })?;

        let layout = model.input_layout();
        let worker = Worker::builder()
            .name("palm inference")
            .spawn(move |(tensor, promise): (Vec<f32>, Promise<PalmPass>)| {
                let output = model.infer(&tensor);
                promise.fulfill((tensor, output));
            })
            .map_err(Error::Worker)?;

        Ok(Self {
            worker,
            pending: None,
            input_size,
            layout,
            anchors,
            nms,
            score_threshold: config.score_threshold,
            capacity,
            tensor_len,
            tensor,
            candidates: Vec::new(),
            detections: Vec::new(),
            records,
            input_buffer,
            detection_buffer,
            count_buffer,
            t_sample: Timer::new("palm sample"),
            t_wait: Timer::new("palm wait"),
            t_decode: Timer::new("palm decode"),
            t_nms: Timer::new("palm NMS"),
        })
    }

    /// Returns the side length of the network input.
    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Returns the number of anchors the network predicts boxes for.
    pub fn anchor_count(&self) -> usize {
        self.anchors.anchor_count()
    }

    /// Maximum number of detections kept per frame.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a pass has been submitted and not yet collected.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Samples `frame` into the network input and starts inference on the worker thread.
    ///
    /// Returns without waiting for the network. The input tensor upload is enqueued right away.
    ///
    /// # Panics
    ///
    /// Panics if the previous pass has not been collected.
    pub fn submit(&mut self, device: &D, frame: &Image) {
        assert!(!self.is_pending(), "palm detection pass already in flight");
        let handle = self.start(device, frame);
        self.pending = Some(handle);
    }

    /// Waits for the pass started by [`PalmDetector::submit`], then decodes and uploads its
    /// detections.
    ///
    /// Returns [`None`] if no pass is in flight. Otherwise, returns the surviving detections in
    /// descending score order and their count, as [`PalmDetector::detect`] does.
    pub fn collect(&mut self, device: &D) -> Option<anyhow::Result<(&[Detection], u32)>> {
        let handle = self.pending.take()?;
        Some(self.finish(device, handle))
    }

    /// Runs palm detection on `frame` and waits for the result.
    ///
    /// Returns the surviving detections in descending score order, and their count. Only
    /// enqueues GPU uploads, never waits for the GPU.
    ///
    /// If inference fails, the previous detections and buffer contents are left as they were.
    pub fn detect(&mut self, device: &D, frame: &Image) -> anyhow::Result<(&[Detection], u32)> {
        assert!(!self.is_pending(), "palm detection pass already in flight");
        let handle = self.start(device, frame);
        self.finish(device, handle)
    }

    fn start(&mut self, device: &D, frame: &Image) -> PromiseHandle<PalmPass> {
        let size = self.input_size;
        let layout = self.layout;
        let letterbox = Letterbox::new(frame.resolution());
        let mut tensor = mem::take(&mut self.tensor);
        tensor.resize(self.tensor_len, 0.0);
        self.t_sample.time(|| {
            frame.sample_tensor(size, layout, &mut tensor, |uv| letterbox.to_pixels(uv))
        });
        self.input_buffer.write(device, &tensor);

        let (promise, handle) = promise();
        self.worker.send((tensor, promise));
        handle
    }

    fn finish(
        &mut self,
        device: &D,
        handle: PromiseHandle<PalmPass>,
    ) -> anyhow::Result<(&[Detection], u32)> {
        let Ok((tensor, output)) = self.t_wait.time(|| handle.block()) else {
            bail!("palm inference worker exited");
        };
        self.tensor = tensor;
        let output = output?;

        let size = self.input_size;
        self.t_decode.time(|| {
            decode(
                &self.anchors,
                size,
                &output,
                self.score_threshold,
                &mut self.candidates,
            )
        })?;
        log::trace!("{} palm candidates above threshold", self.candidates.len());

        self.detections.clear();
        let candidates = &mut self.candidates;
        let nms = &mut self.nms;
        let detections = &mut self.detections;
        self.t_nms
            .time(|| detections.extend(nms.process(candidates)));
        if self.detections.len() > self.capacity {
            log::warn!(
                "{} palm detections exceed capacity of {}, dropping the lowest scores",
                self.detections.len(),
                self.capacity,
            );
            self.detections.truncate(self.capacity);
        }
        log::trace!("{} palm detections after NMS", self.detections.len());

        self.records.clear();
        self.records
            .extend(self.detections.iter().map(Detection::to_record));
        self.detection_buffer.write(device, &self.records);
        let count = self.detections.len() as u32;
        self.count_buffer.write(device, &[count]);

        Ok((&self.detections, count))
    }

    /// Returns the detections of the last successfully completed pass.
    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    /// Copies the detection count into the `instance_count` of the first record in `args`.
    ///
    /// This is a GPU-side copy that is ordered after the uploads of the last completed pass.
    pub fn set_indirect_draw_count(&self, device: &D, args: &Buffer<D, DrawIndirectArgs>) {
        assert!(!args.is_empty(), "draw argument buffer is empty");
        device.copy_buffer(
            self.count_buffer.raw(),
            0,
            args.raw(),
            DrawIndirectArgs::INSTANCE_COUNT_OFFSET,
            4,
        );
    }

    /// The network input tensor, as uploaded by the last submitted pass.
    pub fn input_buffer(&self) -> &Buffer<D, f32> {
        &self.input_buffer
    }

    /// Buffer holding up to [`PalmDetector::capacity`] [`DetectionRecord`]s in descending score
    /// order.
    pub fn detection_buffer(&self) -> &Buffer<D, DetectionRecord> {
        &self.detection_buffer
    }

    /// Buffer holding the number of valid records in the detection buffer.
    pub fn count_buffer(&self) -> &Buffer<D, u32> {
        &self.count_buffer
    }

    pub fn timers(&mut self) -> impl IntoIterator<Item = &mut Timer> + '_ {
        [
            &mut self.t_sample,
            &mut self.t_wait,
            &mut self.t_decode,
            &mut self.t_nms,
        ]
    }
}

/// Length of an RGB input tensor of `size`x`size` pixels.
pub(crate) fn tensor_len(size: u32) -> Option<usize> {
    (size as usize)
        .checked_mul(size as usize)?
        .checked_mul(3)
}

/// Decodes raw network outputs into detections scoring at least `threshold`.
fn decode(
    anchors: &Anchors,
    input_size: u32,
    output: &RawPalmOutput,
    threshold: f32,
    out: &mut Vec<Detection>,
) -> anyhow::Result<()> {
    let count = anchors.anchor_count();
    if output.scores.len() != count || output.boxes.len() != count * BOX_PARAMS {
        bail!(
            "palm model output has {} scores and {} box values, expected {} and {}",
            output.scores.len(),
            output.boxes.len(),
            count,
            count * BOX_PARAMS,
        );
    }

    out.clear();
    for ((anchor, &logit), params) in anchors
        .iter()
        .zip(&output.scores)
        .zip(output.boxes.chunks_exact(BOX_PARAMS))
    {
        let score = score_from_logit(logit);
        if score < threshold || score.is_nan() {
            continue;
        }

        out.push(extract_detection(anchor, input_size as f32, params, score));
    }

    Ok(())
}

fn extract_detection(anchor: &Anchor, input_size: f32, params: &[f32], score: f32) -> Detection {
    let point = |x: f32, y: f32| {
        Point2::new(
            x / input_size + anchor.x_center(),
            y / input_size + anchor.y_center(),
        )
    };

    let center = point(params[0], params[1]);
    let rect = Rect::from_center(
        center.x,
        center.y,
        params[2] / input_size,
        params[3] / input_size,
    );
    let mut keypoints = [Point2::origin(); KEYPOINT_COUNT];
    for (kp, xy) in keypoints.iter_mut().zip(params[4..].chunks_exact(2)) {
        *kp = point(xy[0], xy[1]);
    }

    Detection::new(score, rect, keypoints)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::gpu::HostDevice;

    /// Finds a point-sized palm at the center of the first anchor.
    struct Single;

    impl PalmModel for Single {
        fn input_size(&self) -> u32 {
            8
        }

        fn anchor_layers(&self) -> Vec<LayerInfo> {
            vec![LayerInfo::new(1, 2, 2)]
        }

        fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawPalmOutput> {
            assert_eq!(input.len(), 3 * 8 * 8);
            let mut scores = vec![-10.0; 4];
            scores[0] = 10.0;
            Ok(RawPalmOutput {
                boxes: vec![0.0; 4 * BOX_PARAMS],
                scores,
            })
        }
    }

    fn config(max_detections: u32) -> PipelineConfig {
        PipelineConfig {
            input_size: 8,
            max_detections,
            ..PipelineConfig::default()
        }
    }

    fn anchors() -> Anchors {
        Anchors::calculate(&[LayerInfo::new(1, 2, 2)])
    }

    #[test]
    fn decodes_relative_to_anchor() {
        let anchors = anchors();
        let mut output = RawPalmOutput {
            boxes: vec![0.0; 4 * BOX_PARAMS],
            scores: vec![-10.0; 4],
        };
        // Anchor 3 is centered at (0.75, 0.75).
        output.scores[3] = 10.0;
        let params = &mut output.boxes[3 * BOX_PARAMS..4 * BOX_PARAMS];
        params[..4].copy_from_slice(&[2.0, -2.0, 4.0, 8.0]);
        params[4..6].copy_from_slice(&[0.0, 4.0]);

        let mut out = Vec::new();
        decode(&anchors, 8, &output, 0.5, &mut out).unwrap();
        assert_eq!(out.len(), 1);

        let det = &out[0];
        assert!(det.score() > 0.99);
        assert_relative_eq!(det.rect().center(), Point2::new(1.0, 0.5));
        assert_relative_eq!(det.rect().width(), 0.5);
        assert_relative_eq!(det.rect().height(), 1.0);
        assert_relative_eq!(det.keypoints()[0], Point2::new(0.75, 1.25));
        assert_relative_eq!(det.keypoints()[1], Point2::new(0.75, 0.75));
    }

    #[test]
    fn nothing_below_threshold_survives() {
        let anchors = anchors();
        let mut rng = fastrand::Rng::with_seed(99);
        for _ in 0..20 {
            let output = RawPalmOutput {
                boxes: (0..4 * BOX_PARAMS).map(|_| rng.f32()).collect(),
                scores: (0..4).map(|_| (rng.f32() - 0.5) * 10.0).collect(),
            };
            let threshold = rng.f32();
            let mut out = Vec::new();
            decode(&anchors, 8, &output, threshold, &mut out).unwrap();
            assert!(out.iter().all(|det| det.score() >= threshold));
        }
    }

    #[test]
    fn wrong_output_shape_is_an_error() {
        let output = RawPalmOutput {
            boxes: vec![0.0; 3 * BOX_PARAMS],
            scores: vec![0.0; 4],
        };
        assert!(decode(&anchors(), 8, &output, 0.5, &mut Vec::new()).is_err());
    }

    #[test]
    fn capacity_is_limited_by_anchors() {
        let device = HostDevice::with_budget(1 << 20);
        let detector = PalmDetector::new(&device, Box::new(Single), &config(u32::MAX)).unwrap();
        assert_eq!(detector.capacity(), 4);
        assert_eq!(detector.detection_buffer().len(), 4);
    }

    #[test]
    fn collect_picks_up_submitted_pass() {
        let device = HostDevice::new();
        let mut detector = PalmDetector::new(&device, Box::new(Single), &config(8)).unwrap();
        assert!(detector.collect(&device).is_none());

        detector.submit(&device, &Image::new(16, 16));
        assert!(detector.is_pending());
        let (detections, count) = detector.collect(&device).unwrap().unwrap();
        assert_eq!(count, 1);
        assert_relative_eq!(detections[0].rect().center(), Point2::new(0.25, 0.25));
        assert!(!detector.is_pending());
        assert_eq!(detector.count_buffer().read_back(&device).unwrap(), [1]);

        // The input tensor comes back from the worker and is reused.
        let (_, count) = detector.detect(&device, &Image::new(16, 16)).unwrap();
        assert_eq!(count, 1);
    }
}
