//! Pure-Rust backend: a linear classifier over per-channel means.
//!
//! The model blob is a little-endian `f32` weight matrix of shape
//! `[classes, channels]`. Useful for demos and tests where no ONNX model is
//! around; output is deterministic for a given input.

use anyhow::Result;
use ndarray::{Array2, ArrayD, Axis};

use super::Engine;

pub struct LinearEngine {
    weights: Array2<f32>,
}

impl LinearEngine {
    pub fn from_bytes(model: &[u8], channels: usize) -> Result<Self> {
        anyhow::ensure!(channels > 0, "channel count must be non-zero");
        anyhow::ensure!(
            !model.is_empty() && model.len() % (4 * channels) == 0,
            "linear model must hold classes x {} f32 weights, got {} bytes",
            channels,
            model.len()
        );
        let values: Vec<f32> = model
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        anyhow::ensure!(values.iter().all(|v| v.is_finite()), "linear model has non-finite weights");
        let classes = values.len() / channels;
        Ok(Self { weights: Array2::from_shape_vec((classes, channels), values)? })
    }

    pub fn classes(&self) -> usize {
        self.weights.nrows()
    }
}

impl Engine for LinearEngine {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn infer_array(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        anyhow::ensure!(
            input.ndim() == 4 && input.shape()[0] == 1 && input.shape()[1] == self.weights.ncols(),
            "linear: expected (1, {}, H, W), got {:?}",
            self.weights.ncols(),
            input.shape()
        );
        let plane = input.index_axis(Axis(0), 0);
        let means: Vec<f32> = plane
            .axis_iter(Axis(0))
            .map(|channel| channel.mean().unwrap_or(0.0))
            .collect();
        let logits = self.weights.dot(&ndarray::Array1::from(means));
        Ok(logits.insert_axis(Axis(0)).into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, Ix2};

    fn weights(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_logits_follow_channel_means() {
        // class 0 likes red, class 1 likes blue
        let mut engine = LinearEngine::from_bytes(&weights(&[1.0, 0.0, 0.0, 0.0, 0.0, 1.0]), 3).unwrap();
        assert_eq!(engine.classes(), 2);

        let mut input = Array4::<f32>::zeros((1, 3, 4, 4));
        input.index_axis_mut(Axis(1), 2).fill(2.0);
        let out = engine.infer_array(input.into_dyn()).unwrap().into_dimensionality::<Ix2>().unwrap();
        assert_eq!(out.shape(), &[1, 2]);
        assert_eq!(out[[0, 0]], 0.0);
        assert_eq!(out[[0, 1]], 2.0);
    }

    #[test]
    fn test_rejects_ragged_blob() {
        assert!(LinearEngine::from_bytes(&[0u8; 10], 3).is_err());
        assert!(LinearEngine::from_bytes(&[], 3).is_err());
    }

    #[test]
    fn test_rejects_wrong_channel_count() {
        let mut engine = LinearEngine::from_bytes(&weights(&[1.0, 1.0, 1.0]), 3).unwrap();
        assert!(engine.infer_array(Array4::<f32>::zeros((1, 1, 2, 2)).into_dyn()).is_err());
    }
}
