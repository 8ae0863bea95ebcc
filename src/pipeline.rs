//! Pipeline abstraction for pre/post-processing.
//!
//! The preprocessor turns a frame into the model's input tensor, the
//! postprocessor turns raw logits into a ranking. Both are shared between the
//! analyzer and its worker.

use std::sync::Arc;

use ndarray::ArrayD;

use crate::error::AnalyzerError;
use crate::postprocess::{Ranking, SoftmaxTopK};
use crate::preprocess::ImagePreprocessor;
use crate::types::{Config, FrameView};

/// Converts a frame into an input tensor.
///
/// Implementations resize, orient and normalize; a frame they cannot handle
/// is reported as [`AnalyzerError::Preprocess`].
pub trait Preprocessor: Send + Sync {
    fn run(&self, frame: FrameView<'_>) -> Result<ArrayD<f32>, AnalyzerError>;
}

/// Converts raw model output into ranked classes.
///
/// Implementations turn logits into probabilities and pick the best classes.
pub trait Postprocessor: Send + Sync {
    fn run(&self, logits: ArrayD<f32>) -> Result<Ranking, AnalyzerError>;
}

/// Pre and post stages around one engine.
///
/// Cheap to clone; the worker owns one copy.
#[derive(Clone)]
pub struct Pipeline {
    pub pre: Arc<dyn Preprocessor>,
    pub post: Arc<dyn Postprocessor>,
}

impl Pipeline {
    /// Creates a pipeline from explicit stages.
    ///
    /// # Arguments
    ///
    /// * `pre` - Frame to tensor stage
    /// * `post` - Logits to ranking stage
    pub fn new(pre: Arc<dyn Preprocessor>, post: Arc<dyn Postprocessor>) -> Self {
        Self { pre, post }
    }

    /// Stretch-resize + normalize in, softmax + top-k out.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Runtime configuration; `[input]` and `[output]` are used
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            pre: Arc::new(ImagePreprocessor::new(cfg.input_spec(), &cfg.input)),
            post: Arc::new(SoftmaxTopK::new(cfg.output.top_k)),
        }
    }

    /// Applies preprocessing to a frame.
    ///
    /// # Arguments
    ///
    /// * `frame` - Borrowed pixels plus size, format and rotation
    ///
    /// # Returns
    ///
    /// Normalized `(1, C, H, W)` tensor, or a `Preprocess` error
    pub fn run_pre(&self, frame: FrameView<'_>) -> Result<ArrayD<f32>, AnalyzerError> {
        self.pre.run(frame)
    }

    /// Applies postprocessing to the engine output.
    ///
    /// # Arguments
    ///
    /// * `logits` - Raw output tensor, shape `(classes)` or `(1, classes)`
    ///
    /// # Returns
    ///
    /// Top-k class indices with their probabilities, best first
    pub fn run_post(&self, logits: ArrayD<f32>) -> Result<Ranking, AnalyzerError> {
        self.post.run(logits)
    }
}
