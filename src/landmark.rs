//! Hand landmark estimation.
//!
//! The [`LandmarkDetector`] crops the frame to a [`CropRegion`], runs a [`LandmarkModel`] on the
//! crop and maps the resulting landmarks back into normalized input space.

use std::mem;

use anyhow::bail;
use nalgebra::Point2;
use pawawwewism::{promise, Promise, PromiseHandle, Worker};

use crate::{
    config::PipelineConfig,
    error::Error,
    gpu::{staging_vec, Buffer, BufferKind, Device},
    image::Image,
    nn::CnnInputShape,
    palm::tensor_len,
    resolution::Letterbox,
    roi::CropRegion,
    timer::Timer,
};

/// A set of 3D landmarks.
///
/// Positions are stored as `[x, y, z]`. X and Y are in normalized input space; Z is depth
/// relative to the wrist, in the same units.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    positions: Vec<[f32; 3]>,
}

impl LandmarkSet {
    /// Creates a set of `len` landmarks, all at the origin.
    pub fn new(len: usize) -> Self {
        Self {
            positions: vec![[0.0; 3]; len],
        }
    }

    pub fn from_positions(positions: Vec<[f32; 3]>) -> Self {
        Self { positions }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[[f32; 3]] {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut [[f32; 3]] {
        &mut self.positions
    }

    /// Returns the position of landmark `index`.
    pub fn get(&self, index: usize) -> [f32; 3] {
        self.positions[index]
    }

    /// Returns the position of a named hand landmark.
    pub fn hand(&self, landmark: HandLandmark) -> [f32; 3] {
        self.get(landmark as usize)
    }
}

/// Whether a hand is a left or right hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
}

impl Handedness {
    /// Interprets the raw handedness output of the landmark network.
    pub fn from_score(score: f32) -> Self {
        if score > 0.5 {
            Handedness::Right
        } else {
            Handedness::Left
        }
    }
}

/// Names for the hand pose landmarks.
///
/// # Terminology
///
/// - **CMC**: [Carpometacarpal joint], the lowest joint of the thumb, located near the wrist.
/// - **MCP**: [Metacarpophalangeal joint], the lower joint forming the knuckles near the palm of
///   the hand.
/// - **PIP**: Proximal Interphalangeal joint, the joint between the MCP and DIP.
/// - **DIP**: Distal Interphalangeal joint, the highest joint of a finger.
/// - **Tip**: This landmark is just placed on the tip of the finger, above the DIP.
///
/// [Carpometacarpal joint]: https://en.wikipedia.org/wiki/Carpometacarpal_joint
/// [Metacarpophalangeal joint]: https://en.wikipedia.org/wiki/Metacarpophalangeal_joint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandLandmark {
    Wrist,
    ThumbCmc,
    ThumbMcp,
    ThumbIp,
    ThumbTip,
    IndexFingerMcp,
    IndexFingerPip,
    IndexFingerDip,
    IndexFingerTip,
    MiddleFingerMcp,
    MiddleFingerPip,
    MiddleFingerDip,
    MiddleFingerTip,
    RingFingerMcp,
    RingFingerPip,
    RingFingerDip,
    RingFingerTip,
    PinkyMcp,
    PinkyPip,
    PinkyDip,
    PinkyTip,
}

/// Number of landmarks the hand landmark networks output.
pub const HAND_LANDMARK_COUNT: usize = HandLandmark::PinkyTip as usize + 1;

/// Raw outputs of a landmark network.
#[derive(Debug, Clone, Default)]
pub struct RawLandmarks {
    /// Landmark positions in crop input pixels (`0..input_size`). Z uses the same scale.
    pub positions: Vec<[f32; 3]>,
    /// Probability that a hand is present in the crop.
    pub presence: f32,
    /// Raw handedness score, see [`Handedness::from_score`].
    pub handedness: f32,
}

/// Inference backend for landmark estimation.
pub trait LandmarkModel {
    /// Side length of the square input tensor.
    fn input_size(&self) -> u32;

    fn input_layout(&self) -> CnnInputShape {
        CnnInputShape::NCHW
    }

    /// Number of landmarks the network outputs.
    fn vertex_count(&self) -> u32 {
        HAND_LANDMARK_COUNT as u32
    }

    /// Runs the network on an RGB input tensor with values in `[0, 1]`.
    fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawLandmarks>;
}

impl<M: LandmarkModel + ?Sized> LandmarkModel for Box<M> {
    fn input_size(&self) -> u32 {
        (**self).input_size()
    }

    fn input_layout(&self) -> CnnInputShape {
        (**self).input_layout()
    }

    fn vertex_count(&self) -> u32 {
        (**self).vertex_count()
    }

    fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawLandmarks> {
        (**self).infer(input)
    }
}

/// Landmarks estimated for one crop region, before temporal filtering.
#[derive(Debug, Clone)]
pub struct LandmarkEstimate {
    landmarks: LandmarkSet,
    presence: f32,
    raw_handedness: f32,
}

impl LandmarkEstimate {
    /// The estimated landmarks, in normalized input space.
    pub fn landmarks(&self) -> &LandmarkSet {
        &self.landmarks
    }

    /// Probability that the crop contains a hand.
    pub fn presence(&self) -> f32 {
        self.presence
    }

    /// Returns the estimated handedness of the hand in the image.
    ///
    /// This assumes that the camera image is passed in as-is, and the returned value should only be
    /// relied on when the presence is over some threshold.
    pub fn handedness(&self) -> Handedness {
        Handedness::from_score(self.raw_handedness)
    }
}

/// Result of one inference pass, along with the input tensor for reuse.
type LandmarkPass = (Vec<f32>, anyhow::Result<RawLandmarks>);

/// Estimates hand landmarks inside crop regions.
///
/// Like the palm detector, the network runs on its own worker thread between
/// [`LandmarkDetector::submit`] and [`LandmarkDetector::collect`].
pub struct LandmarkDetector<D: Device> {
    worker: Worker<(Vec<f32>, Promise<LandmarkPass>)>,
    pending: Option<(CropRegion, PromiseHandle<LandmarkPass>)>,
    input_size: u32,
    layout: CnnInputShape,
    vertex_count: usize,
    tensor_len: usize,
    tensor: Vec<f32>,
    crop_buffer: Buffer<D, f32>,
    estimate: LandmarkEstimate,
    t_crop: Timer,
    t_wait: Timer,
}

impl<D: Device> LandmarkDetector<D> {
    /// Creates a landmark detector, allocating its crop buffer on `device` and starting its
    /// worker.
    ///
    /// Fails with [`Error::Config`] if the model's input size or landmark count does not match
    /// `config`.
    pub fn new(
        device: &D,
        mut model: Box<dyn LandmarkModel + Send>,
        config: &PipelineConfig,
    ) -> Result<Self, Error> {
        let input_size = model.input_size();
        if input_size != config.crop_size {
            return Err(Error::config(format!(
                "landmark model takes {0}x{0} inputs, but `crop_size` is {1}",
                input_size, config.crop_size,
            )));
        }
        if model.vertex_count() != config.vertex_count {
            return Err(Error::config(format!(
                "landmark model outputs {} landmarks, but `vertex_count` is {}",
                model.vertex_count(),
                config.vertex_count,
            )));
        }

        let vertex_count = config.vertex_count as usize;
        let tensor_len = tensor_len(input_size)
            .ok_or_else(|| Error::config(format!("crop size {input_size} is too large")))?;
        let crop_buffer = Buffer::new(device, "landmark_crop", tensor_len, BufferKind::Storage)?;
        let tensor = staging_vec("landmark_crop", tensor_len)?;
        let positions = staging_vec("landmarks", vertex_count)?;

        let layout = model.input_layout();
        let worker = Worker::builder()
            .name("landmark inference")
            .spawn(move |(tensor, promise): (Vec<f32>, Promise<LandmarkPass>)| {
                let output = model.infer(&tensor);
                promise.fulfill((tensor, output));
            })
            .map_err(Error::Worker)?;

        Ok(Self {
            worker,
            pending: None,
            input_size,
            layout,
            vertex_count,
            tensor_len,
            tensor,
            crop_buffer,
            estimate: LandmarkEstimate {
                landmarks: LandmarkSet::from_positions(positions),
                presence: 0.0,
                raw_handedness: 0.0,
            },
            t_crop: Timer::new("crop"),
            t_wait: Timer::new("landmark wait"),
        })
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// Whether a pass has been submitted and not yet collected.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Crops `region` out of `frame` and starts inference on the worker thread.
    ///
    /// The crop is sampled in a single bilinear pass through the region's affine transform and
    /// its upload is enqueued right away.
    ///
    /// # Panics
    ///
    /// Panics if the previous pass has not been collected.
    pub fn submit(&mut self, device: &D, frame: &Image, region: &CropRegion) {
        assert!(!self.is_pending(), "landmark pass already in flight");
        let handle = self.start(device, frame, region);
        self.pending = Some((*region, handle));
    }

    /// Waits for the pass started by [`LandmarkDetector::submit`] and maps its landmarks out of
    /// the crop region it was submitted with.
    ///
    /// Returns [`None`] if no pass is in flight. If inference fails, the previous estimate is
    /// left as it was.
    pub fn collect(&mut self) -> Option<anyhow::Result<&LandmarkEstimate>> {
        let (region, handle) = self.pending.take()?;
        Some(self.finish(&region, handle))
    }

    /// Waits for a pass in flight and throws its result away.
    pub fn discard(&mut self) {
        if let Some((_, handle)) = self.pending.take() {
            if let Ok((tensor, _)) = self.t_wait.time(|| handle.block()) {
                self.tensor = tensor;
            }
        }
    }

    /// Estimates landmarks of the hand inside `region` of `frame` and waits for the result.
    pub fn detect(
        &mut self,
        device: &D,
        frame: &Image,
        region: &CropRegion,
    ) -> anyhow::Result<&LandmarkEstimate> {
        assert!(!self.is_pending(), "landmark pass already in flight");
        let handle = self.start(device, frame, region);
        self.finish(region, handle)
    }

    fn start(
        &mut self,
        device: &D,
        frame: &Image,
        region: &CropRegion,
    ) -> PromiseHandle<LandmarkPass> {
        let size = self.input_size;
        let layout = self.layout;
        let letterbox = Letterbox::new(frame.resolution());
        let mut tensor = mem::take(&mut self.tensor);
        tensor.resize(self.tensor_len, 0.0);
        self.t_crop.time(|| {
            frame.sample_tensor(size, layout, &mut tensor, |uv| {
                letterbox.to_pixels(region.transform_out(uv))
            })
        });
        self.crop_buffer.write(device, &tensor);

        let (promise, handle) = promise();
        self.worker.send((tensor, promise));
        handle
    }

    fn finish(
        &mut self,
        region: &CropRegion,
        handle: PromiseHandle<LandmarkPass>,
    ) -> anyhow::Result<&LandmarkEstimate> {
        let Ok((tensor, output)) = self.t_wait.time(|| handle.block()) else {
            bail!("landmark inference worker exited");
        };
        self.tensor = tensor;
        let raw = output?;
        if raw.positions.len() != self.vertex_count {
            bail!(
                "landmark model returned {} landmarks, expected {}",
                raw.positions.len(),
                self.vertex_count,
            );
        }

        let scale = self.input_size as f32;
        for (out, &[x, y, z]) in self
            .estimate
            .landmarks
            .positions_mut()
            .iter_mut()
            .zip(&raw.positions)
        {
            let p = region.transform_out(Point2::new(x / scale, y / scale));
            *out = [p.x, p.y, z / scale * region.size()];
        }
        self.estimate.presence = raw.presence;
        self.estimate.raw_handedness = raw.handedness;
        log::trace!(
            "landmarks: presence={:.2}, handedness={:?}",
            raw.presence,
            self.estimate.handedness(),
        );

        Ok(&self.estimate)
    }

    /// Returns the result of the last successfully completed pass.
    pub fn estimate(&self) -> &LandmarkEstimate {
        &self.estimate
    }

    /// The landmark network input, as uploaded by the last submitted pass.
    pub fn crop_buffer(&self) -> &Buffer<D, f32> {
        &self.crop_buffer
    }

    pub fn timers(&mut self) -> impl IntoIterator<Item = &mut Timer> + '_ {
        [&mut self.t_crop, &mut self.t_wait]
    }
}
