use std::path::Path;

use anyhow::{Context, Result};

use crate::types::Config;

pub mod linear;
#[cfg(feature = "onnx")]
pub mod onnx;

/// A loaded model. Not reentrant: callers serialize every use, including drop.
pub trait Engine: Send {
    fn name(&self) -> &'static str;
    fn infer_array(&mut self, input: ndarray::ArrayD<f32>) -> Result<ndarray::ArrayD<f32>>;
}

pub struct EngineFactory;

impl EngineFactory {
    /// Reads the model file and binds it into a backend session.
    pub fn create(cfg: &Config) -> Result<Box<dyn Engine>> {
        let model = load_model_bytes(&cfg.model.model_path)?;
        Self::create_from_bytes(cfg, &model)
    }

    pub fn create_from_bytes(cfg: &Config, model: &[u8]) -> Result<Box<dyn Engine>> {
        match cfg.model.backend.as_str() {
            #[cfg(feature = "onnx")]
            "onnx" => Ok(Box::new(crate::engine::onnx::OnnxEngine::from_bytes(cfg, model)?)),

            "linear" => Ok(Box::new(crate::engine::linear::LinearEngine::from_bytes(
                model,
                cfg.input.channels,
            )?)),

            other => anyhow::bail!(
                "backend '{}' is not supported (available: {})",
                other,
                if cfg!(feature = "onnx") { "onnx, linear" } else { "linear" }
            ),
        }
    }
}

pub fn load_model_bytes(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("cannot read model {}", path.display()))?;
    anyhow::ensure!(!bytes.is_empty(), "model {} is empty", path.display());
    Ok(bytes)
}
