//! Neural Network inference with `tract`.
//!
//! The pipeline only talks to networks through [`PalmModel`] and [`LandmarkModel`]. This module
//! provides implementations of both for the ONNX exports of MediaPipe's palm detection and hand
//! landmark networks.

use std::{fs, path::Path, sync::Arc};

use anyhow::{bail, Context};
use tract_onnx::prelude::{
    tvec, Framework, Graph, InferenceModelExt, SimplePlan, TValue, Tensor, TypedFact, TypedOp,
};

use crate::{
    detection::ssd::LayerInfo,
    landmark::{LandmarkModel, RawLandmarks},
    palm::{PalmModel, RawPalmOutput, BOX_PARAMS},
};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Describes in what order a CNN expects its input image data.
///
/// - `N` is the number of images, always 1 here.
/// - `C` is the number of color channels, 3 for RGB inputs.
/// - `H` and `W` are the height and width of the input, respectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CnnInputShape {
    /// Shape is `[N, C, H, W]`.
    NCHW,
    /// Shape is `[N, H, W, C]`.
    NHWC,
}

/// A loaded and optimized neural network.
pub struct NeuralNetwork {
    plan: Model,
    input_shape: Vec<usize>,
    output_shapes: Vec<Vec<usize>>,
}

/// An output tensor of a [`NeuralNetwork`].
#[derive(Debug, Clone)]
pub struct Output {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NeuralNetwork {
    /// Loads a pre-trained model from an ONNX file path.
    ///
    /// The path must have a `.onnx` extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => bail!("neural network file must have `.onnx` extension"),
        }

        let data = fs::read(path)
            .with_context(|| format!("failed to read network file '{}'", path.display()))?;
        Self::from_onnx(&data)
            .with_context(|| format!("failed to load network '{}'", path.display()))
    }

    /// Loads a pre-trained model from an in-memory ONNX file.
    ///
    /// Returns an error if the network data is malformed, if the network takes more than one
    /// input, or if input or output shapes are not fixed.
    pub fn from_onnx(data: &[u8]) -> anyhow::Result<Self> {
        let graph = tract_onnx::onnx()
            .model_for_read(&mut &*data)?
            .into_optimized()?;
        let plan = SimplePlan::new(graph)?;

        let model = plan.model();
        if model.inputs.len() != 1 {
            bail!(
                "network has to take exactly 1 input, this one takes {}",
                model.inputs.len(),
            );
        }
        let input_shape = concrete_shape(model.input_fact(0)?)?;
        let output_shapes = (0..model.outputs.len())
            .map(|i| concrete_shape(model.output_fact(i)?))
            .collect::<anyhow::Result<Vec<_>>>()?;
        log::debug!(
            "loaded network: input {:?}, outputs {:?}",
            input_shape,
            output_shapes,
        );

        Ok(Self {
            plan,
            input_shape,
            output_shapes,
        })
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn output_shapes(&self) -> &[Vec<usize>] {
        &self.output_shapes
    }

    /// Returns the side length of a square image input in the given layout.
    pub fn square_input_size(&self, layout: CnnInputShape) -> anyhow::Result<u32> {
        let (w, h) = match (layout, &*self.input_shape) {
            (CnnInputShape::NCHW, &[1, 3, h, w]) | (CnnInputShape::NHWC, &[1, h, w, 3]) => (w, h),
            _ => bail!(
                "invalid model input shape for {:?} CNN: {:?}",
                layout,
                self.input_shape,
            ),
        };
        if w != h {
            bail!("network input is not square: {}x{}", w, h);
        }
        Ok(w.try_into()?)
    }

    /// Runs the network on a single input tensor in row-major order.
    #[doc(alias = "infer")]
    pub fn estimate(&self, input: &[f32]) -> anyhow::Result<Vec<Output>> {
        let tensor = Tensor::from_shape(&self.input_shape, input)?;
        let outputs = self.plan.run(tvec![TValue::from_const(Arc::new(tensor))])?;
        outputs
            .iter()
            .map(|t| -> anyhow::Result<Output> {
                Ok(Output {
                    shape: t.shape().to_vec(),
                    data: t.as_slice::<f32>()?.to_vec(),
                })
            })
            .collect()
    }
}

fn concrete_shape(fact: &TypedFact) -> anyhow::Result<Vec<usize>> {
    match fact.shape.as_concrete() {
        Some(shape) => Ok(shape.to_vec()),
        None => bail!("network has a symbolic tensor shape: {:?}", fact.shape),
    }
}

/// MediaPipe's palm detection network (lite or full), loaded from ONNX.
///
/// Outputs `[1, 2016, 18]` box parameters and `[1, 2016, 1]` score logits.
pub struct OnnxPalmModel {
    nn: NeuralNetwork,
    input_size: u32,
    layout: CnnInputShape,
}

impl OnnxPalmModel {
    /// Loads a palm detection network taking NCHW inputs.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::new(NeuralNetwork::from_path(path)?, CnnInputShape::NCHW)
    }

    pub fn new(nn: NeuralNetwork, layout: CnnInputShape) -> anyhow::Result<Self> {
        let input_size = nn.square_input_size(layout)?;
        match nn.output_shapes() {
            [boxes, scores, ..]
                if boxes.last() == Some(&BOX_PARAMS) && scores.last() == Some(&1) => {}
            shapes => bail!("unexpected palm detection outputs: {:?}", shapes),
        }

        Ok(Self {
            nn,
            input_size,
            layout,
        })
    }
}

impl PalmModel for OnnxPalmModel {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn input_layout(&self) -> CnnInputShape {
        self.layout
    }

    fn anchor_layers(&self) -> Vec<LayerInfo> {
        // The feature maps are 1/8 and 1/16 of the input resolution.
        let size = self.input_size;
        vec![
            LayerInfo::new(2, size / 8, size / 8),
            LayerInfo::new(6, size / 16, size / 16),
        ]
    }

    fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawPalmOutput> {
        let mut outputs = self.nn.estimate(input)?.into_iter();
        let (Some(boxes), Some(scores)) = (outputs.next(), outputs.next()) else {
            bail!("palm detection network returned fewer than 2 outputs");
        };
        Ok(RawPalmOutput {
            boxes: boxes.data,
            scores: scores.data,
        })
    }
}

/// MediaPipe's hand landmark network (lite or full), loaded from ONNX.
///
/// Outputs `[1, 63]` screen landmarks, `[1, 1]` presence and `[1, 1]` handedness (and world
/// landmarks, which are ignored).
pub struct OnnxLandmarkModel {
    nn: NeuralNetwork,
    input_size: u32,
    layout: CnnInputShape,
    vertex_count: u32,
}

impl OnnxLandmarkModel {
    /// Loads a hand landmark network taking NCHW inputs.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::new(NeuralNetwork::from_path(path)?, CnnInputShape::NCHW)
    }

    pub fn new(nn: NeuralNetwork, layout: CnnInputShape) -> anyhow::Result<Self> {
        let input_size = nn.square_input_size(layout)?;
        let vertex_count = match nn.output_shapes() {
            [landmarks, presence, handedness, ..]
                if presence.iter().product::<usize>() == 1
                    && handedness.iter().product::<usize>() == 1
                    && landmarks.iter().product::<usize>() % 3 == 0 =>
            {
                landmarks.iter().product::<usize>() / 3
            }
            shapes => bail!("unexpected hand landmark outputs: {:?}", shapes),
        };

        Ok(Self {
            nn,
            input_size,
            layout,
            vertex_count: vertex_count.try_into()?,
        })
    }
}

impl LandmarkModel for OnnxLandmarkModel {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn input_layout(&self) -> CnnInputShape {
        self.layout
    }

    fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    fn infer(&mut self, input: &[f32]) -> anyhow::Result<RawLandmarks> {
        let outputs = self.nn.estimate(input)?;
        let [landmarks, presence, handedness, ..] = &outputs[..] else {
            bail!("hand landmark network returned fewer than 3 outputs");
        };

        Ok(RawLandmarks {
            positions: landmarks
                .data
                .chunks_exact(3)
                .map(|c| [c[0], c[1], c[2]])
                .collect(),
            presence: presence.data[0],
            handedness: handedness.data[0],
        })
    }
}
