//! Runs the hand pipeline on a still image, as if it was a video stream.
//!
//! Usage: `hand_image <palm.onnx> <landmark.onnx> <image> [config.json]`

use anyhow::Context;
use handpipe::{
    gpu::Gpu,
    image::Image,
    nn::{OnnxLandmarkModel, OnnxPalmModel},
    resolution::Letterbox,
    timer::FpsCounter,
    HandPipeline, PipelineConfig,
};
use nalgebra::Point2;

const FRAMES: usize = 30;

fn main() -> anyhow::Result<()> {
    handpipe::init_logger!();

    let mut args = std::env::args().skip(1);
    let usage = "usage: hand_image <palm.onnx> <landmark.onnx> <image> [config.json]";
    let palm_path = args.next().context(usage)?;
    let landmark_path = args.next().context(usage)?;
    let image_path = args.next().context(usage)?;
    let config = match args.next() {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    let palm = OnnxPalmModel::from_path(palm_path)?;
    let landmark = OnnxLandmarkModel::from_path(landmark_path)?;
    let image = Image::load(image_path)?;

    let gpu = Gpu::open_blocking()?;
    let mut pipeline = HandPipeline::new(gpu, config, palm, landmark)?;
    let mut fps = FpsCounter::new("hand pipeline");

    for _ in 0..FRAMES {
        pipeline.tick(&image)?;
        fps.tick_with(pipeline.timers());
    }

    let out = pipeline.outputs();
    println!("{} palm detection(s)", out.count);
    for det in out.detections {
        let rect = det.rect();
        println!(
            "  score {:.3} at ({:.3}, {:.3}), {:.3}x{:.3}",
            det.score(),
            rect.x_center(),
            rect.y_center(),
            rect.width(),
            rect.height(),
        );
    }

    if let Some(region) = out.region {
        let center = region.center();
        println!(
            "crop region: center ({:.3}, {:.3}), size {:.3}, rotation {:.1}°",
            center.x,
            center.y,
            region.size(),
            region.rotation().to_degrees(),
        );
    }

    match out.landmarks {
        Some(landmarks) => {
            println!(
                "{:?} hand, presence {:.3}",
                out.handedness,
                out.presence.unwrap_or(0.0)
            );
            let letterbox = Letterbox::new(image.resolution());
            for (i, &[x, y, z]) in landmarks.positions().iter().enumerate() {
                let px = letterbox.to_pixels(Point2::new(x, y));
                println!("  {i:2}: ({:.1}, {:.1}) z={z:.3}", px.x, px.y);
            }
        }
        None => println!("no hand"),
    }

    pipeline.shutdown();
    Ok(())
}
