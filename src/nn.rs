//! Neural network inference behind an opaque engine interface.
//!
//! The detection pipeline treats the network as a black box that turns a
//! preprocessed image tensor into two raw output tensors (classification
//! logits and anchor-relative box regressors). The shipped implementation,
//! [`TractEngine`], runs ONNX models on the CPU via `tract`; a different
//! backend can be substituted by implementing [`InferenceEngine`].

use std::sync::Arc;

use tract_onnx::prelude::{
    Framework, Graph, InferenceModelExt, SimplePlan, TValue, Tensor as TractTensor, TypedFact,
    TypedOp, tvec,
};

use crate::{Error, Result};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Describes in what order a network expects its input image data.
///
/// - `N` is the number of images, fixed at 1 here.
/// - `C` is the number of color channels, 3 for these networks.
/// - `H` and `W` are the height and width of the input, respectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelOrder {
    /// Shape is `[N, C, H, W]`.
    Nchw,
    /// Shape is `[N, H, W, C]`.
    Nhwc,
}

/// The raw tensors produced by one forward pass.
#[derive(Debug)]
pub struct InferenceOutput {
    /// One raw classification logit per anchor (`[N_anchors]`, flattened).
    /// The model's activation (sigmoid) has *not* been applied.
    pub scores: Vec<f32>,
    /// 18 anchor-relative regressor values per anchor (`[N_anchors, 18]`,
    /// flattened): 4 box parameters followed by 7 keypoint coordinate pairs,
    /// of which the pipeline consumes the first 6.
    pub boxes: Vec<f32>,
}

/// A palm detection network, treated as an opaque forward-pass executor.
///
/// Implementations own the model's working memory exclusively; running
/// multiple detector instances concurrently requires independent engine
/// instances.
pub trait InferenceEngine: Send + 'static {
    /// Side length of the square input tensor, in pixels.
    fn input_size(&self) -> u32;

    /// Channel ordering of the input tensor.
    fn channel_order(&self) -> ChannelOrder;

    /// Number of SSD anchors the model predicts. Fixed by the model
    /// architecture (896 for the reference 128-pixel configuration).
    fn num_anchors(&self) -> usize;

    /// Runs a forward pass on a flat `input_size² * 3` tensor.
    fn infer(&mut self, tensor: &[f32]) -> Result<InferenceOutput>;
}

/// [`InferenceEngine`] backed by a `tract` ONNX model plan.
pub struct TractEngine {
    plan: Model,
    input_size: u32,
    order: ChannelOrder,
    num_anchors: usize,
    scores_output: usize,
    boxes_output: usize,
}

impl TractEngine {
    /// Loads and optimizes an in-memory ONNX model.
    ///
    /// Fails with [`Error::ModelLoad`] if the model data is malformed, if
    /// the model does not take exactly one `[1,3,S,S]` or `[1,S,S,3]` input,
    /// or if no pair of `[1,N,1]` score / `[1,N,18]` regressor outputs can
    /// be identified.
    pub fn from_onnx(data: &[u8]) -> Result<Self> {
        let graph = tract_onnx::onnx()
            .model_for_read(&mut &*data)
            .map_err(load_err)?
            .into_optimized()
            .map_err(load_err)?;
        let plan = graph.into_runnable().map_err(load_err)?;
        let model = plan.model();

        if model.inputs.len() != 1 {
            return Err(Error::ModelLoad(format!(
                "network has to take exactly 1 input, this one takes {}",
                model.inputs.len(),
            )));
        }

        let fact = model.input_fact(0).map_err(load_err)?;
        let Some(shape) = fact.shape.as_concrete() else {
            return Err(Error::ModelLoad("symbolic input tensor shape".into()));
        };
        let (order, size) = match shape {
            [1, 3, h, w] if h == w => (ChannelOrder::Nchw, *w),
            [1, h, w, 3] if h == w => (ChannelOrder::Nhwc, *w),
            _ => {
                return Err(Error::ModelLoad(format!(
                    "unsupported input tensor shape {shape:?}",
                )));
            }
        };
        let input_size =
            u32::try_from(size).map_err(|_| Error::ModelLoad("oversized input".into()))?;

        // Identify the two output tensors by shape rather than by name or
        // order; exports of the same model differ in both.
        let mut scores = None;
        let mut boxes = None;
        for i in 0..model.outputs.len() {
            let fact = model.output_fact(i).map_err(load_err)?;
            match fact.shape.as_concrete() {
                Some([1, n, 1]) => scores = Some((i, *n)),
                Some([1, n, 18]) => boxes = Some((i, *n)),
                _ => {}
            }
        }
        let (Some((scores_output, n_scores)), Some((boxes_output, n_boxes))) = (scores, boxes)
        else {
            return Err(Error::ModelLoad(
                "could not identify score and regressor outputs".into(),
            ));
        };
        if n_scores != n_boxes {
            return Err(Error::ModelLoad(format!(
                "output anchor counts disagree ({n_scores} vs. {n_boxes})",
            )));
        }

        log::debug!(
            "loaded palm model: input {input_size}x{input_size} ({order:?}), {n_scores} anchors",
        );

        Ok(Self {
            plan,
            input_size,
            order,
            num_anchors: n_scores,
            scores_output,
            boxes_output,
        })
    }
}

impl InferenceEngine for TractEngine {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn channel_order(&self) -> ChannelOrder {
        self.order
    }

    fn num_anchors(&self) -> usize {
        self.num_anchors
    }

    fn infer(&mut self, tensor: &[f32]) -> Result<InferenceOutput> {
        let s = self.input_size as usize;
        if tensor.len() != s * s * 3 {
            return Err(Error::InvalidInput(format!(
                "input tensor has {} values, expected {}",
                tensor.len(),
                s * s * 3,
            )));
        }

        let shape = match self.order {
            ChannelOrder::Nchw => [1, 3, s, s],
            ChannelOrder::Nhwc => [1, s, s, 3],
        };
        let input = TractTensor::from_shape(&shape, tensor).map_err(infer_err)?;
        let outputs = self
            .plan
            .run(tvec![TValue::from_const(Arc::new(input))])
            .map_err(infer_err)?;

        let scores = outputs[self.scores_output]
            .as_slice::<f32>()
            .map_err(infer_err)?
            .to_vec();
        let boxes = outputs[self.boxes_output]
            .as_slice::<f32>()
            .map_err(infer_err)?
            .to_vec();
        Ok(InferenceOutput { scores, boxes })
    }
}

fn load_err(e: impl std::fmt::Display) -> Error {
    Error::ModelLoad(e.to_string())
}

fn infer_err(e: impl std::fmt::Display) -> Error {
    Error::Inference(e.to_string())
}
