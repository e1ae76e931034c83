//! The hand tracking pipeline.
//!
//! [`HandPipeline::tick`] runs these stages:
//!
//! 1. palm detection, with the detection count copied into the draw argument records on the GPU
//! 2. crop region derivation from the most confident palm
//! 3. landmark estimation inside the crop region
//! 4. temporal filtering of the landmarks
//!
//! The networks run on worker threads. A tick collects the palm and landmark passes submitted by
//! the previous tick, filters the landmarks, derives a crop region from the palms, and submits the
//! new frame to both networks. The crop region found in one frame is therefore applied to the
//! next one, which is fine as long as the hand moves little between frames.
//!
//! Stages that have no input are skipped, and their outputs hold the values of the last frame
//! that produced them. After the hand has been missing for more than
//! [`PipelineConfig::lost_frame_threshold`] frames, the tracking state is reset, so that a hand
//! appearing elsewhere is not smoothed towards the old position.

use crate::{
    config::PipelineConfig,
    detection::{Detection, KEYPOINT_COUNT},
    error::{Error, Result, Stage},
    filter::{Ema, LandmarkFilter},
    gpu::{Buffer, BufferKind, DetectionRecord, Device, DrawIndirectArgs, RegionRecord},
    image::Image,
    landmark::{Handedness, LandmarkDetector, LandmarkModel, LandmarkSet},
    palm::{PalmDetector, PalmModel},
    roi::{CropRegion, RoiDeriver},
    timer::Timer,
};

/// Vertices per detection box (two triangles).
pub const BOX_VERTEX_COUNT: u32 = 6;
/// Vertices per detection for keypoint markers.
///
/// This only describes the topology of the renderer that consumes
/// [`PipelineOutputs::keypoint_draw_args`]: one 4-vertex quad per palm keypoint. A renderer
/// drawing keypoints another way can copy the detection count from
/// [`PalmDetector::count_buffer`] into draw arguments of its own.
pub const KEYPOINT_VERTEX_COUNT: u32 = 4 * KEYPOINT_COUNT as u32;

/// The two neural network stages of the pipeline.
pub struct Detectors<D: Device> {
    pub palm: PalmDetector<D>,
    pub landmark: LandmarkDetector<D>,
}

/// Everything a frame produced, for consumption by a renderer.
///
/// Buffers are shared references; only the pipeline writes to them.
pub struct PipelineOutputs<'a, D: Device> {
    /// Palm detections of the last frame, in descending score order.
    pub detections: &'a [Detection],
    /// Number of records in `detection_buffer` that are valid.
    pub count: u32,
    pub detection_buffer: &'a Buffer<D, DetectionRecord>,
    /// Draw arguments for detection boxes, with `instance_count` equal to `count`.
    pub box_draw_args: &'a Buffer<D, DrawIndirectArgs>,
    /// Draw arguments for detection keypoints, with `instance_count` equal to `count`.
    pub keypoint_draw_args: &'a Buffer<D, DrawIndirectArgs>,
    /// The crop region the landmark detector looked at last.
    pub region: Option<CropRegion>,
    pub region_buffer: &'a Buffer<D, RegionRecord>,
    /// Stabilized landmarks, or [`None`] if no hand is being tracked.
    pub landmarks: Option<&'a LandmarkSet>,
    /// Stabilized landmarks as `[x, y, z, valid]`.
    pub filter_buffer: &'a Buffer<D, [f32; 4]>,
    /// Presence score of the last accepted landmark pass.
    pub presence: Option<f32>,
    pub handedness: Option<Handedness>,
}

/// Palm detection, landmark estimation and smoothing over a stream of frames.
///
/// All buffers are allocated in [`HandPipeline::new`] and released when the pipeline is shut
/// down or dropped, after the device has finished all work that uses them.
pub struct HandPipeline<D: Device> {
    config: PipelineConfig,
    detectors: Detectors<D>,
    roi: RoiDeriver,
    filter: LandmarkFilter<Ema>,
    region: Option<CropRegion>,
    presence: Option<f32>,
    handedness: Option<Handedness>,
    frames_without_hand: u32,
    region_buffer: Buffer<D, RegionRecord>,
    filter_buffer: Buffer<D, [f32; 4]>,
    box_draw_args: Buffer<D, DrawIndirectArgs>,
    keypoint_draw_args: Buffer<D, DrawIndirectArgs>,
    t_roi: Timer,
    t_filter: Timer,
    device: D,
}

impl<D: Device> HandPipeline<D> {
    /// Creates a pipeline, validating `config` against the models and allocating all buffers.
    pub fn new<P, L>(
        device: D,
        config: PipelineConfig,
        palm_model: P,
        landmark_model: L,
    ) -> Result<Self>
    where
        P: PalmModel + Send + 'static,
        L: LandmarkModel + Send + 'static,
    {
        config.validate()?;

        let detectors = Detectors {
            palm: PalmDetector::new(&device, Box::new(palm_model), &config)?,
            landmark: LandmarkDetector::new(&device, Box::new(landmark_model), &config)?,
        };

        let vertex_count = config.vertex_count as usize;
        let region_buffer = Buffer::new(&device, "crop_region", 1, BufferKind::Storage)?;
        let filter_buffer = Buffer::new(&device, "landmarks", vertex_count, BufferKind::Storage)?;
        let box_draw_args = Buffer::new(&device, "box_draw_args", 1, BufferKind::Indirect)?;
        let keypoint_draw_args =
            Buffer::new(&device, "keypoint_draw_args", 1, BufferKind::Indirect)?;
        box_draw_args.write(&device, &[DrawIndirectArgs::new(BOX_VERTEX_COUNT)]);
        keypoint_draw_args.write(&device, &[DrawIndirectArgs::new(KEYPOINT_VERTEX_COUNT)]);

        log::debug!(
            "hand pipeline ready: {} palm anchors, {}x{} crops, {} landmarks",
            detectors.palm.anchor_count(),
            config.crop_size,
            config.crop_size,
            vertex_count,
        );

        Ok(Self {
            roi: RoiDeriver::new(config.roi),
            filter: LandmarkFilter::new(Ema::new(config.filter_weight), vertex_count),
            config,
            detectors,
            region: None,
            presence: None,
            handedness: None,
            frames_without_hand: 0,
            region_buffer,
            filter_buffer,
            box_draw_args,
            keypoint_draw_args,
            t_roi: Timer::new("ROI"),
            t_filter: Timer::new("filter"),
            device,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detectors(&self) -> &Detectors<D> {
        &self.detectors
    }

    /// Runs one frame through the pipeline.
    ///
    /// Both networks run on worker threads: this picks up the results of the passes submitted
    /// by the previous call, then submits `frame` and returns without waiting for inference.
    /// The returned outputs therefore lag one frame behind `frame`. Only enqueues GPU work,
    /// never waits for it to finish.
    ///
    /// If a neural network fails, [`Error::Inference`] is returned, nothing is submitted, and the
    /// tracking state (crop region, stabilized landmarks, lost frame counter) is left unchanged.
    pub fn tick(&mut self, frame: &Image) -> Result<PipelineOutputs<'_, D>> {
        let palm_done = match self.detectors.palm.collect(&self.device) {
            None => false,
            Some(Ok(_)) => true,
            Some(Err(source)) => {
                return Err(Error::Inference {
                    stage: Stage::Palm,
                    source,
                })
            }
        };
        if palm_done {
            let palm = &self.detectors.palm;
            palm.set_indirect_draw_count(&self.device, &self.box_draw_args);
            palm.set_indirect_draw_count(&self.device, &self.keypoint_draw_args);
        }

        let accepted = match self.detectors.landmark.collect() {
            None => None,
            Some(Err(source)) => {
                return Err(Error::Inference {
                    stage: Stage::Landmark,
                    source,
                })
            }
            Some(Ok(estimate)) => {
                let presence = estimate.presence();
                if presence < self.config.presence_threshold {
                    log::trace!("landmark presence {:.2} below threshold", presence);
                    Some(false)
                } else {
                    if self.frames_without_hand > self.config.lost_frame_threshold {
                        log::debug!("hand reacquired");
                    }
                    self.frames_without_hand = 0;
                    self.presence = Some(presence);
                    self.handedness = Some(estimate.handedness());

                    let filter = &mut self.filter;
                    self.t_filter.time(|| {
                        filter.filter(estimate.landmarks());
                    });
                    self.filter.upload(&self.device, &self.filter_buffer);
                    Some(true)
                }
            }
        };

        let palm_found = !self.detectors.palm.detections().is_empty();
        if accepted == Some(false) || (accepted.is_none() && palm_done && !palm_found) {
            self.hand_missing();
        }

        let region = if palm_done { self.next_region() } else { None };
        self.detectors.palm.submit(&self.device, frame);
        if let Some(region) = region {
            log::trace!("crop region: {:?}", region);
            self.detectors.landmark.submit(&self.device, frame, &region);
            self.region_buffer.write(&self.device, &[region.to_record(self.region.as_ref())]);
            self.region = Some(region);
        }

        Ok(self.outputs())
    }

    /// Derives the crop region for the next landmark pass from the most confident palm.
    fn next_region(&mut self) -> Option<CropRegion> {
        let top = self.detectors.palm.detections().first()?;
        let roi = &self.roi;
        let derived = self.t_roi.time(|| roi.derive(top));
        match derived {
            Some(region) => Some(self.config.roi_smoothing.apply(self.region.as_ref(), region)),
            None if self.region.is_some() => {
                log::warn!("degenerate palm keypoints, holding previous crop region");
                self.region
            }
            None => {
                log::warn!("degenerate palm keypoints and no previous crop region");
                None
            }
        }
    }

    /// Records a frame without landmark update, resetting the tracking state once the hand has
    /// been missing for too long.
    fn hand_missing(&mut self) {
        self.frames_without_hand = self.frames_without_hand.saturating_add(1);
        if self.frames_without_hand > self.config.lost_frame_threshold
            && (self.filter.stabilized().is_some() || self.region.is_some())
        {
            log::debug!(
                "hand lost for {} frames, resetting tracking state",
                self.frames_without_hand,
            );
            self.clear_tracking();
        }
    }

    fn clear_tracking(&mut self) {
        self.filter.reset();
        self.filter.upload(&self.device, &self.filter_buffer);
        self.region = None;
        self.presence = None;
        self.handedness = None;
    }

    /// Returns the outputs of the last frame without processing a new one.
    pub fn outputs(&self) -> PipelineOutputs<'_, D> {
        let palm = &self.detectors.palm;
        PipelineOutputs {
            detections: palm.detections(),
            count: palm.detections().len() as u32,
            detection_buffer: palm.detection_buffer(),
            box_draw_args: &self.box_draw_args,
            keypoint_draw_args: &self.keypoint_draw_args,
            region: self.region,
            region_buffer: &self.region_buffer,
            landmarks: self.filter.stabilized(),
            filter_buffer: &self.filter_buffer,
            presence: self.presence,
            handedness: self.handedness,
        }
    }

    /// Forgets the tracked hand without reallocating anything.
    ///
    /// A landmark pass still in flight is waited for and discarded.
    pub fn reset(&mut self) {
        self.detectors.landmark.discard();
        self.clear_tracking();
        self.frames_without_hand = 0;
    }

    /// Returns the stage timers, for use with [`FpsCounter::tick_with`].
    ///
    /// [`FpsCounter::tick_with`]: crate::timer::FpsCounter::tick_with
    pub fn timers(&mut self) -> impl Iterator<Item = &mut Timer> + '_ {
        let Detectors { palm, landmark } = &mut self.detectors;
        palm.timers()
            .into_iter()
            .chain(landmark.timers())
            .chain([&mut self.t_roi, &mut self.t_filter])
    }

    /// Waits for the device and the inference workers to finish all submitted work, then
    /// releases every buffer.
    pub fn shutdown(self) {
        log::debug!("shutting down hand pipeline");
        drop(self);
    }
}

impl<D: Device> Drop for HandPipeline<D> {
    fn drop(&mut self) {
        self.device.wait_idle();
    }
}
