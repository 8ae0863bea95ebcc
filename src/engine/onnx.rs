//! ONNX Runtime engine (CPU, optionally CUDA) for `ort = 2.0.0-rc.10`.
//!
//! - The model is committed from bytes already in memory.
//! - Input/output names come from the config or, when absent, from the
//!   model's first declared input/output.
//! - The CUDA execution provider is only registered with the `onnx-cuda`
//!   feature and `model.device = "gpu"`.

use anyhow::{Context, Result};
use ndarray::ArrayD;
use ort::{
    session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session},
    value::{DynValue, Tensor},
};

use crate::engine::Engine;
use crate::types::{Config, InputSpec};

pub struct OnnxEngine {
    session: Session,
    input_name: String,
    output_name: String,
    input_spec: InputSpec,
}

impl OnnxEngine {
    pub fn from_bytes(cfg: &Config, model: &[u8]) -> Result<Self> {
        let mut builder = SessionBuilder::new().context("cannot create session builder")?;
        builder = builder.with_optimization_level(GraphOptimizationLevel::Level3)?;
        builder = builder.with_intra_threads(cfg.model.intra_threads)?;

        #[cfg(feature = "onnx-cuda")]
        {
            if cfg.model.device.as_deref().is_some_and(|d| d.eq_ignore_ascii_case("gpu")) {
                builder = builder.with_execution_providers([
                    ort::execution_providers::CUDAExecutionProvider::default().build(),
                ])?;
            }
        }

        let session = builder
            .commit_from_memory(model)
            .with_context(|| format!("cannot load ONNX model ({} bytes)", model.len()))?;

        let input_name = match &cfg.model.input_name {
            Some(name) => name.clone(),
            None => session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .context("ONNX model declares no inputs")?,
        };
        let output_name = match &cfg.model.output_name {
            Some(name) => name.clone(),
            None => session
                .outputs
                .first()
                .map(|o| o.name.clone())
                .context("ONNX model declares no outputs")?,
        };

        Ok(Self {
            session,
            input_name,
            output_name,
            input_spec: cfg.input_spec(),
        })
    }
}

impl Engine for OnnxEngine {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn infer_array(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.input_spec
            .validate(input.shape())
            .context("ONNX: input shape")?;

        let input_tensor: Tensor<f32> = Tensor::from_array(input)?;

        let outputs = self.session.run(ort::inputs![
            self.input_name.as_str() => input_tensor
        ])?;

        let dyn_out: &DynValue = &outputs[self.output_name.as_str()];
        let out_view = dyn_out
            .try_extract_array::<f32>()
            .map_err(|e| anyhow::anyhow!("ONNX: output '{}' is not a f32 tensor: {}", self.output_name, e))?;

        Ok(out_view.to_owned())
    }
}
