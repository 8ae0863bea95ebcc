use std::cmp::Ordering;

use ndarray::ArrayD;

use crate::error::AnalyzerError;
use crate::pipeline::Postprocessor;

/// Top-ranked class indices with their probabilities, best first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    pub indices: Vec<usize>,
    pub scores: Vec<f32>,
}

/// Numerically stable softmax.
///
/// Degenerate input (no finite maximum, or a sum that is not a positive
/// finite number) yields all zeros.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let mut probs: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
        return vec![0.0; logits.len()];
    }
    for p in &mut probs {
        *p /= sum;
    }
    probs
}

/// Indices of the `k` largest values, one linear scan per slot.
///
/// Ties go to the lower index and NaN never beats a number. With fewer than
/// `k` values the missing slots are filled with index 0.
pub fn top_k(values: &[f32], k: usize) -> Vec<usize> {
    let mut picked: Vec<usize> = Vec::with_capacity(k);
    for _ in 0..k {
        let mut best: Option<(usize, f32)> = None;
        for (i, &v) in values.iter().enumerate() {
            if picked.contains(&i) {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, max)) => {
                    (max.is_nan() && !v.is_nan()) || v.partial_cmp(&max) == Some(Ordering::Greater)
                }
            };
            if better {
                best = Some((i, v));
            }
        }
        picked.push(best.map_or(0, |(i, _)| i));
    }
    picked
}

pub struct SoftmaxTopK {
    k: usize,
}

impl SoftmaxTopK {
    pub fn new(k: usize) -> Self {
        Self { k }
    }
}

impl Postprocessor for SoftmaxTopK {
    fn run(&self, logits: ArrayD<f32>) -> Result<Ranking, AnalyzerError> {
        // (1, classes) or (classes)
        let shape = logits.shape();
        let single = match shape {
            [_] => true,
            [1, _] => true,
            _ => false,
        };
        if !single {
            return Err(AnalyzerError::Inference(anyhow::anyhow!(
                "expected a single row of logits, got shape {:?}",
                shape
            )));
        }

        let logits: Vec<f32> = logits.iter().copied().collect();
        let probs = softmax(&logits);
        let indices = top_k(&probs, self.k);
        let scores = indices
            .iter()
            .map(|&i| probs.get(i).copied().unwrap_or(0.0))
            .collect();
        Ok(Ranking { indices, scores })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.5, -3.0, 0.25, 8.0, 2.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_softmax_large_logits_stay_finite() {
        let probs = softmax(&[1000.0, 1000.0, -1000.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!(probs[2].abs() < 1e-6);
    }

    #[test]
    fn test_softmax_uniform() {
        let probs = softmax(&[0.7; 8]);
        for p in probs {
            assert!((p - 0.125).abs() < 1e-6);
        }
    }

    #[test]
    fn test_softmax_empty() {
        assert!(softmax(&[]).is_empty());
    }

    #[test]
    fn test_softmax_degenerate_input_is_all_zero() {
        assert_eq!(softmax(&[f32::NEG_INFINITY; 3]), vec![0.0; 3]);
        assert_eq!(softmax(&[1.0, f32::INFINITY]), vec![0.0; 2]);
        assert_eq!(softmax(&[1.0, f32::NAN, 2.0]), vec![0.0; 3]);
    }

    #[test]
    fn test_softmax_partial_neg_infinity() {
        let probs = softmax(&[f32::NEG_INFINITY, 0.0]);
        assert_eq!(probs, vec![0.0, 1.0]);
    }

    #[test]
    fn test_top_k_nan_never_wins() {
        assert_eq!(top_k(&[f32::NAN, 0.2, 0.1], 2), vec![1, 2]);
    }

    #[test]
    fn test_degenerate_logits_rank_with_zero_scores() {
        let post = SoftmaxTopK::new(3);
        let logits = Array::from_elem((1, 3), f32::NEG_INFINITY).into_dyn();
        let ranking = post.run(logits).unwrap();
        assert_eq!(ranking.indices, vec![0, 1, 2]);
        assert_eq!(ranking.scores, vec![0.0; 3]);
    }

    #[test]
    fn test_top_k_descending_and_distinct() {
        let idx = top_k(&[0.1, 0.4, 0.05, 0.3, 0.15], 3);
        assert_eq!(idx, vec![1, 3, 4]);
    }

    #[test]
    fn test_top_k_ties_prefer_lower_index() {
        let idx = top_k(&[0.2, 0.3, 0.3, 0.2], 3);
        assert_eq!(idx, vec![1, 2, 0]);
    }

    #[test]
    fn test_top_k_pads_short_input_with_zero() {
        assert_eq!(top_k(&[0.3, 0.7], 3), vec![1, 0, 0]);
        assert_eq!(top_k(&[], 3), vec![0, 0, 0]);
    }

    #[test]
    fn test_dominant_logit_scenario() {
        let post = SoftmaxTopK::new(3);
        let logits = Array::from_shape_vec((1, 4), vec![0.0, 0.0, 0.0, 10.0]).unwrap().into_dyn();
        let ranking = post.run(logits).unwrap();
        assert_eq!(ranking.indices, vec![3, 0, 1]);
        assert!((ranking.scores[0] - 1.0).abs() < 1e-3);
        assert!(ranking.scores[1] < 1e-4);
        assert!(ranking.scores[2] < 1e-4);
    }

    #[test]
    fn test_rejects_batched_logits() {
        let post = SoftmaxTopK::new(3);
        let logits = Array::<f32, _>::zeros((2, 4)).into_dyn();
        assert!(matches!(post.run(logits), Err(AnalyzerError::Inference(_))));
    }
}
