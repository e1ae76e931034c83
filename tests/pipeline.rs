//! Drives `HandPipeline` end to end on a host device with scripted models.
//!
//! The models run on worker threads and a tick publishes the results of the frame submitted by
//! the tick before it. Scripted outputs are therefore queued up front, in frame order: the
//! workers consume them in the order the frames were submitted.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use approx::assert_relative_eq;
use handpipe::{
    detection::ssd::LayerInfo,
    error::{Error, Stage},
    gpu::{DrawIndirectArgs, HostDevice},
    image::Image,
    landmark::{LandmarkModel, LandmarkSet, RawLandmarks},
    palm::{PalmModel, RawPalmOutput, BOX_PARAMS},
    pipeline::{BOX_VERTEX_COUNT, KEYPOINT_VERTEX_COUNT},
    HandPipeline, PipelineConfig,
};

const PALM_INPUT: u32 = 8;
const CROP: u32 = 4;
/// Anchor centers of a single 2x2 feature map with one box per cell.
const ANCHORS: [(f32, f32); 4] = [(0.25, 0.25), (0.75, 0.25), (0.25, 0.75), (0.75, 0.75)];

#[derive(Clone, Default)]
struct Script {
    palms: Arc<Mutex<VecDeque<anyhow::Result<RawPalmOutput>>>>,
    landmarks: Arc<Mutex<VecDeque<anyhow::Result<RawLandmarks>>>>,
    palm_calls: Arc<AtomicUsize>,
    landmark_calls: Arc<AtomicUsize>,
}

impl Script {
    fn palms(&self, output: anyhow::Result<RawPalmOutput>) {
        self.palms.lock().unwrap().push_back(output);
    }

    fn landmarks(&self, output: anyhow::Result<RawLandmarks>) {
        self.landmarks.lock().unwrap().push_back(output);
    }

    fn landmark_calls(&self) -> usize {
        self.landmark_calls.load(Ordering::SeqCst)
    }
}

struct FakePalm(Script);

impl PalmModel for FakePalm {
    fn input_size(&self) -> u32 {
        PALM_INPUT
    }

    fn anchor_layers(&self) -> Vec<LayerInfo> {
        vec![LayerInfo::new(1, 2, 2)]
    }

    fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawPalmOutput> {
        assert_eq!(input.len(), (3 * PALM_INPUT * PALM_INPUT) as usize);
        self.0.palm_calls.fetch_add(1, Ordering::SeqCst);
        self.0
            .palms
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(no_palms()))
    }
}

/// Delays every pass of the wrapped palm model by `.1`.
struct SlowPalm(FakePalm, Duration);

impl PalmModel for SlowPalm {
    fn input_size(&self) -> u32 {
        self.0.input_size()
    }

    fn anchor_layers(&self) -> Vec<LayerInfo> {
        self.0.anchor_layers()
    }

    fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawPalmOutput> {
        thread::sleep(self.1);
        self.0.infer(input)
    }
}

struct FakeLandmarks(Script);

impl LandmarkModel for FakeLandmarks {
    fn input_size(&self) -> u32 {
        CROP
    }

    fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawLandmarks> {
        assert_eq!(input.len(), (3 * CROP * CROP) as usize);
        self.0.landmark_calls.fetch_add(1, Ordering::SeqCst);
        self.0
            .landmarks
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(hand(0.0)))
    }
}

fn logit(score: f32) -> f32 {
    (score / (1.0 - score)).ln()
}

fn no_palms() -> RawPalmOutput {
    RawPalmOutput {
        boxes: vec![0.0; ANCHORS.len() * BOX_PARAMS],
        scores: vec![-10.0; ANCHORS.len()],
    }
}

/// Adds an upright palm centered at `center` (normalized input space), predicted by `anchor`.
fn add_palm(
    out: &mut RawPalmOutput,
    anchor: usize,
    score: f32,
    center: (f32, f32),
    size: (f32, f32),
) {
    let (ax, ay) = ANCHORS[anchor];
    let to_offset = |x: f32, y: f32| [(x - ax) * PALM_INPUT as f32, (y - ay) * PALM_INPUT as f32];

    let params = &mut out.boxes[anchor * BOX_PARAMS..(anchor + 1) * BOX_PARAMS];
    params[..2].copy_from_slice(&to_offset(center.0, center.1));
    params[2] = size.0 * PALM_INPUT as f32;
    params[3] = size.1 * PALM_INPUT as f32;
    for (i, kp) in params[4..].chunks_exact_mut(2).enumerate() {
        let (x, y) = match i {
            // wrist below the palm center, middle finger MCP above it
            0 => (center.0, center.1 + size.1 * 0.4),
            2 => (center.0, center.1 - size.1 * 0.4),
            _ => center,
        };
        kp.copy_from_slice(&to_offset(x, y));
    }
    out.scores[anchor] = logit(score);
}

fn one_palm(score: f32) -> RawPalmOutput {
    let mut out = no_palms();
    add_palm(&mut out, 3, score, (0.5, 0.5), (0.2, 0.2));
    out
}

fn hand(offset: f32) -> RawLandmarks {
    RawLandmarks {
        positions: (0..21)
            .map(|i| [1.0 + offset + i as f32 * 0.1, 2.0 - offset, 0.25])
            .collect(),
        presence: 0.9,
        handedness: 0.8,
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        input_size: PALM_INPUT,
        crop_size: CROP,
        lost_frame_threshold: 2,
        ..PipelineConfig::default()
    }
}

fn ticks(pipeline: &mut HandPipeline<HostDevice>, n: usize) {
    for _ in 0..n {
        pipeline.tick(&frame()).unwrap();
    }
}

fn pipeline(device: &HostDevice) -> (HandPipeline<HostDevice>, Script) {
    let script = Script::default();
    let pipeline = HandPipeline::new(
        device.clone(),
        config(),
        FakePalm(script.clone()),
        FakeLandmarks(script.clone()),
    )
    .unwrap();
    (pipeline, script)
}

fn frame() -> Image {
    Image::from_fn(32, 24, |x, y| [(x * 8) as u8, (y * 8) as u8, 128])
}

fn bits(set: &LandmarkSet) -> Vec<[u32; 3]> {
    set.positions()
        .iter()
        .map(|p| p.map(f32::to_bits))
        .collect()
}

#[test]
fn one_clean_detection() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);
    script.palms(Ok(one_palm(0.9)));

    // Nothing has finished yet.
    let out = pipeline.tick(&frame()).unwrap();
    assert_eq!(out.count, 0);
    assert!(out.region.is_none());
    drop(out);

    let out = pipeline.tick(&frame()).unwrap();
    assert_eq!(out.count, 1);
    assert_eq!(out.detections.len(), 1);
    assert_relative_eq!(out.detections[0].score(), 0.9, epsilon = 1e-5);
    assert_relative_eq!(out.detections[0].rect().x_center(), 0.5, epsilon = 1e-5);
    assert!(out.region.is_some());
    assert!(out.landmarks.is_none());

    let records = out.detection_buffer.read_back(&device).unwrap();
    assert_relative_eq!(records[0].score, 0.9, epsilon = 1e-5);
    let region = out.region_buffer.read_back(&device).unwrap();
    assert_eq!(region[0].region[2], out.region.unwrap().size());
    drop(out);

    // The landmark pass on the crop region lands one tick later.
    let out = pipeline.tick(&frame()).unwrap();
    assert!(out.landmarks.is_some());
    assert_eq!(out.presence, Some(0.9));
    let filtered = out.filter_buffer.read_back(&device).unwrap();
    assert!(filtered.iter().all(|v| v[3] == 1.0));
    drop(out);

    assert_eq!(script.landmark_calls(), 1);

    // The first observation is passed through unfiltered.
    let raw = pipeline.detectors().landmark.estimate().landmarks().clone();
    assert_eq!(pipeline.outputs().landmarks, Some(&raw));
}

#[test]
fn tick_does_not_wait_for_inference() {
    const INFERENCE_TIME: Duration = Duration::from_millis(500);

    let device = HostDevice::new();
    let script = Script::default();
    script.palms(Ok(one_palm(0.9)));
    let mut pipeline = HandPipeline::new(
        device,
        config(),
        SlowPalm(FakePalm(script.clone()), INFERENCE_TIME),
        FakeLandmarks(script),
    )
    .unwrap();

    let start = Instant::now();
    let out = pipeline.tick(&frame()).unwrap();
    assert_eq!(out.count, 0);
    let elapsed = start.elapsed();
    assert!(elapsed < INFERENCE_TIME / 2, "tick blocked for {elapsed:?}");

    // The next tick picks up the finished pass.
    let out = pipeline.tick(&frame()).unwrap();
    assert_eq!(out.count, 1);
    assert!(start.elapsed() >= INFERENCE_TIME);
}

#[test]
fn overlapping_detections_are_suppressed() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);

    // IoU of the two boxes is 0.9.
    let mut palms = no_palms();
    add_palm(&mut palms, 0, 0.95, (0.5, 0.5), (0.2, 0.2));
    add_palm(&mut palms, 3, 0.7, (0.5, 0.5), (0.2, 0.18));
    script.palms(Ok(palms));

    ticks(&mut pipeline, 1);
    let out = pipeline.tick(&frame()).unwrap();
    assert_eq!(out.count, 1);
    assert_relative_eq!(out.detections[0].score(), 0.95, epsilon = 1e-5);
    assert_relative_eq!(out.detections[0].rect().height(), 0.2, epsilon = 1e-5);
}

#[test]
fn zero_detections_hold_previous_landmarks() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);
    script.palms(Ok(one_palm(0.9)));

    ticks(&mut pipeline, 3);
    let before = bits(pipeline.outputs().landmarks.unwrap());

    let out = pipeline.tick(&frame()).unwrap();
    assert_eq!(out.count, 0);
    assert!(out.detections.is_empty());
    assert_eq!(bits(out.landmarks.unwrap()), before);
    drop(out);

    assert_eq!(script.landmark_calls(), 1);
}

#[test]
fn zero_detections_without_history() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);

    ticks(&mut pipeline, 1);
    let out = pipeline.tick(&frame()).unwrap();
    assert_eq!(out.count, 0);
    assert!(out.region.is_none());
    assert!(out.landmarks.is_none());
    assert_eq!(out.presence, None);
    let filtered = out.filter_buffer.read_back(&device).unwrap();
    assert!(filtered.iter().all(|v| v[3] == 0.0));
    drop(out);

    assert_eq!(script.landmark_calls(), 0);
}

#[test]
fn reacquired_hand_starts_from_raw_landmarks() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);

    // Frame 1 has a hand, frames 2 to 5 have none, frame 6 has one again.
    script.palms(Ok(one_palm(0.9)));
    for _ in 0..4 {
        script.palms(Ok(no_palms()));
    }
    script.palms(Ok(one_palm(0.9)));
    script.landmarks(Ok(hand(0.0)));
    script.landmarks(Ok(hand(1.0)));

    ticks(&mut pipeline, 3);
    assert!(pipeline.outputs().landmarks.is_some());

    // Missing for more than `lost_frame_threshold` frames.
    ticks(&mut pipeline, 3);
    assert!(pipeline.outputs().landmarks.is_none());
    assert!(pipeline.outputs().region.is_none());

    ticks(&mut pipeline, 2);
    let raw = pipeline.detectors().landmark.estimate().landmarks().clone();
    assert_eq!(pipeline.outputs().landmarks, Some(&raw));
}

#[test]
fn short_gap_keeps_smoothing() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);

    script.palms(Ok(one_palm(0.9)));
    script.palms(Ok(no_palms()));
    script.palms(Ok(no_palms()));
    script.palms(Ok(one_palm(0.9)));
    script.landmarks(Ok(hand(0.0)));
    script.landmarks(Ok(hand(1.0)));

    ticks(&mut pipeline, 6);
    assert_eq!(script.landmark_calls(), 2);

    let raw = pipeline.detectors().landmark.estimate().landmarks().clone();
    assert_ne!(pipeline.outputs().landmarks, Some(&raw));
}

#[test]
fn low_presence_holds_landmarks() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);

    script.palms(Ok(one_palm(0.9)));
    script.palms(Ok(one_palm(0.9)));
    script.landmarks(Ok(hand(0.0)));
    script.landmarks(Ok(RawLandmarks {
        presence: 0.1,
        ..hand(1.0)
    }));

    ticks(&mut pipeline, 3);
    let before = bits(pipeline.outputs().landmarks.unwrap());

    let out = pipeline.tick(&frame()).unwrap();
    assert_eq!(bits(out.landmarks.unwrap()), before);
    assert_eq!(out.presence, Some(0.9));
    drop(out);

    assert_eq!(script.landmark_calls(), 2);
}

#[test]
fn inference_failures_leave_state_untouched() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);

    // Palm passes run on frames 1, 2, 4 and 5; frame 3 is never submitted because the palm
    // pass of frame 2 fails. Landmark passes run on frames 2 and 5.
    script.palms(Ok(one_palm(0.9)));
    script.palms(Err(anyhow::anyhow!("palm backend failed")));
    script.palms(Ok(one_palm(0.9)));
    script.landmarks(Ok(hand(0.0)));
    script.landmarks(Err(anyhow::anyhow!("landmark backend failed")));

    ticks(&mut pipeline, 2);
    let landmarks = pipeline.outputs().landmarks.cloned();
    let region = pipeline.outputs().region;
    assert!(region.is_some());

    let result = pipeline.tick(&frame());
    assert!(matches!(
        result,
        Err(Error::Inference {
            stage: Stage::Palm,
            ..
        })
    ));
    assert_eq!(pipeline.outputs().landmarks.cloned(), landmarks);
    assert_eq!(pipeline.outputs().region, region);

    // The landmark pass of frame 2 is still picked up.
    ticks(&mut pipeline, 2);
    let landmarks = pipeline.outputs().landmarks.cloned();
    let region = pipeline.outputs().region;
    assert!(landmarks.is_some());

    let result = pipeline.tick(&frame());
    assert!(matches!(
        result,
        Err(Error::Inference {
            stage: Stage::Landmark,
            ..
        })
    ));
    assert_eq!(pipeline.outputs().landmarks.cloned(), landmarks);
    assert_eq!(pipeline.outputs().region, region);

    // The pipeline keeps working afterwards.
    ticks(&mut pipeline, 1);
    assert!(pipeline.tick(&frame()).is_ok());
}

#[test]
fn draw_args_follow_detection_count() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);

    let mut two = no_palms();
    add_palm(&mut two, 0, 0.9, (0.25, 0.25), (0.2, 0.2));
    add_palm(&mut two, 3, 0.8, (0.75, 0.75), (0.2, 0.2));
    script.palms(Ok(two));
    script.palms(Ok(no_palms()));
    script.palms(Ok(one_palm(0.9)));

    ticks(&mut pipeline, 1);
    for expected in [2, 0, 1] {
        let out = pipeline.tick(&frame()).unwrap();
        assert_eq!(out.count, expected);

        let boxes = out.box_draw_args.read_back(&device).unwrap();
        let keypoints = out.keypoint_draw_args.read_back(&device).unwrap();
        assert_eq!(
            boxes[0],
            DrawIndirectArgs {
                instance_count: expected,
                ..DrawIndirectArgs::new(BOX_VERTEX_COUNT)
            }
        );
        assert_eq!(keypoints[0].vertex_count, KEYPOINT_VERTEX_COUNT);
        assert_eq!(keypoints[0].instance_count, expected);
    }
}

#[test]
fn degenerate_palm_without_history_skips_landmarks() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);

    let mut palms = one_palm(0.9);
    // Zero-size box puts wrist and middle finger MCP on the same spot.
    add_palm(&mut palms, 3, 0.9, (0.5, 0.5), (0.0, 0.0));
    script.palms(Ok(palms));

    ticks(&mut pipeline, 1);
    let out = pipeline.tick(&frame()).unwrap();
    assert_eq!(out.count, 1);
    assert!(out.region.is_none());
    drop(out);

    ticks(&mut pipeline, 1);
    assert_eq!(script.landmark_calls(), 0);
}

#[test]
fn shutdown_releases_all_buffers() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);
    assert!(device.live_buffers() > 0);

    // Both passes are still in flight when shutting down.
    script.palms(Ok(one_palm(0.9)));
    ticks(&mut pipeline, 2);
    pipeline.shutdown();

    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_bytes(), 0);
}

#[test]
fn dropping_releases_all_buffers() {
    let device = HostDevice::new();
    let (pipeline, _script) = pipeline(&device);
    drop(pipeline);
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn reset_discards_landmarks_in_flight() {
    let device = HostDevice::new();
    let (mut pipeline, script) = pipeline(&device);
    script.palms(Ok(one_palm(0.9)));

    ticks(&mut pipeline, 2);
    pipeline.reset();
    let out = pipeline.tick(&frame()).unwrap();
    assert!(out.landmarks.is_none());
    assert!(out.region.is_none());
    drop(out);
    assert_eq!(script.landmark_calls(), 1);
}

#[test]
fn allocation_failure_is_fatal() {
    // The first budget fails on the palm input, the second once the detectors are running.
    for budget in [64, 1500] {
        let device = HostDevice::with_budget(budget);
        let script = Script::default();
        let result = HandPipeline::new(
            device.clone(),
            config(),
            FakePalm(script.clone()),
            FakeLandmarks(script),
        );
        assert!(matches!(result, Err(Error::Allocation(_))));
        assert_eq!(device.live_buffers(), 0);
    }
}

#[test]
fn detection_capacity_is_limited_by_anchors() {
    let device = HostDevice::with_budget(1 << 20);
    let script = Script::default();
    let config = PipelineConfig {
        max_detections: u32::MAX,
        ..config()
    };
    let pipeline = HandPipeline::new(
        device.clone(),
        config,
        FakePalm(script.clone()),
        FakeLandmarks(script),
    )
    .unwrap();

    assert_eq!(pipeline.detectors().palm.capacity(), ANCHORS.len());
    assert!(device.live_bytes() < 4096);
}

#[test]
fn model_mismatch_is_a_config_error() {
    let script = Script::default();
    let result = HandPipeline::new(
        HostDevice::new(),
        PipelineConfig::default(),
        FakePalm(script.clone()),
        FakeLandmarks(script),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn pipeline_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<HandPipeline<HostDevice>>();
}
