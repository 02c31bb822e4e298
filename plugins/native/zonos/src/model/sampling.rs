// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Token sampling for the per-codebook heads.

use rand::{distr::Distribution, rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Sampling knobs applied to every codebook at every step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Softmax temperature; zero or below selects greedy argmax.
    pub temperature: f32,
    /// Nucleus threshold; zero disables it.
    pub top_p: f32,
    /// Keep only the k most probable tokens; zero disables it.
    pub top_k: usize,
    /// Drop tokens below `min_p` times the peak probability; zero disables it.
    pub min_p: f32,
    pub repetition_penalty: f32,
    /// Number of most recent tokens per codebook the penalty looks at.
    pub repetition_penalty_window: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.0,
            top_k: 0,
            min_p: 0.1,
            repetition_penalty: 3.0,
            repetition_penalty_window: 2,
        }
    }
}

impl SamplingParams {
    /// # Errors
    ///
    /// Returns a description of the first out-of-range field.
    pub fn validate(&self) -> Result<(), String> {
        if !self.temperature.is_finite() {
            return Err("temperature must be finite".to_string());
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(format!("top_p must be within [0, 1], got {}", self.top_p));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(format!("min_p must be within [0, 1], got {}", self.min_p));
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err(format!("repetition_penalty must be positive, got {}", self.repetition_penalty));
        }
        if self.repetition_penalty_window == 0 {
            return Err("repetition_penalty_window must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Scales the logits of every token present in `history`, once per occurrence.
///
/// Negative logits are multiplied by the penalty and positive ones divided,
/// so both move toward less likely. History ids beyond the vocabulary are
/// clamped to its last entry.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    let Some(last) = logits.len().checked_sub(1) else {
        return;
    };
    let mut factors = vec![1.0f32; logits.len()];
    for &token in history {
        factors[(token as usize).min(last)] *= penalty;
    }
    for (logit, factor) in logits.iter_mut().zip(factors) {
        if *logit <= 0.0 {
            *logit *= factor;
        } else {
            *logit /= factor;
        }
    }
}

/// Temperature-scaled softmax.
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|l| ((l - max) / temperature).exp()).collect();
    normalize(&mut probs);
    probs
}

fn normalize(probs: &mut [f32]) {
    let total: f32 = probs.iter().sum();
    if total > 0.0 {
        for p in probs.iter_mut() {
            *p /= total;
        }
    }
}

fn sorted_desc(probs: &[f32]) -> Vec<f32> {
    let mut sorted = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    sorted
}

/// Keeps the smallest set of tokens whose mass reaches `p`.
pub fn apply_top_p(probs: &mut [f32], p: f32) {
    let sorted = sorted_desc(probs);
    let mut cumulative = 0.0;
    let mut threshold = f32::NEG_INFINITY;
    for value in sorted {
        cumulative += value;
        // Mass before this token already exceeds p.
        if cumulative - value > p {
            break;
        }
        threshold = value;
    }
    for prob in probs.iter_mut() {
        if *prob < threshold {
            *prob = 0.0;
        }
    }
    normalize(probs);
}

/// Keeps tokens at least as probable as the k-th most probable one.
pub fn apply_top_k(probs: &mut [f32], k: usize) {
    let sorted = sorted_desc(probs);
    let Some(&pivot) = sorted.get(k.min(sorted.len()).saturating_sub(1)) else {
        return;
    };
    for prob in probs.iter_mut() {
        if *prob < pivot {
            *prob = 0.0;
        }
    }
    normalize(probs);
}

/// Drops tokens less probable than `min_p` times the peak probability.
pub fn apply_min_p(probs: &mut [f32], min_p: f32) {
    let peak = probs.iter().copied().fold(0.0, f32::max);
    let cutoff = min_p * peak;
    for prob in probs.iter_mut() {
        if *prob < cutoff {
            *prob = 0.0;
        }
    }
    normalize(probs);
}

fn argmax(values: &[f32]) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    values.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)).map_or(0, |(i, _)| i as u32)
}

/// Seeded sampler; one instance per generation run.
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
    seed: u64,
}

impl Sampler {
    /// Uses `seed` when given, otherwise draws one.
    pub fn new(params: SamplingParams, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(rand::random);
        Self { params, rng: StdRng::seed_from_u64(seed), seed }
    }

    pub const fn seed(&self) -> u64 {
        self.seed
    }

    pub const fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Draws one token from a single row of logits.
    ///
    /// `history` holds recently generated tokens for this row; pass `None`
    /// to skip the repetition penalty.
    pub fn sample(&mut self, logits: &mut [f32], history: Option<&[u32]>) -> u32 {
        let params = self.params;
        if let Some(history) = history {
            if (params.repetition_penalty - 1.0).abs() > f32::EPSILON {
                let start = history.len().saturating_sub(params.repetition_penalty_window);
                apply_repetition_penalty(logits, &history[start..], params.repetition_penalty);
            }
        }
        if params.temperature <= 0.0 {
            return argmax(logits);
        }

        let mut probs = softmax(logits, params.temperature);
        if params.top_p > 0.0 {
            apply_top_p(&mut probs, params.top_p);
        }
        if params.top_k > 0 {
            apply_top_k(&mut probs, params.top_k);
        }
        if params.min_p > 0.0 {
            apply_min_p(&mut probs, params.min_p);
        }
        match rand::distr::weighted::WeightedIndex::new(&probs) {
            #[allow(clippy::cast_possible_truncation)]
            Ok(dist) => dist.sample(&mut self.rng) as u32,
            Err(e) => {
                tracing::warn!(error = %e, "Degenerate distribution, falling back to argmax");
                argmax(logits)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetition_penalty_per_occurrence() {
        let mut logits = vec![2.0, -2.0, 1.0, 4.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 3, 3], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 1.0, 1.0]);

        let mut logits = vec![1.0, 1.0];
        apply_repetition_penalty(&mut logits, &[1025], 2.0);
        assert_eq!(logits, vec![1.0, 0.5]);
    }

    #[test]
    fn test_top_p_keeps_nucleus() {
        let mut probs = vec![0.5, 0.3, 0.15, 0.05];
        apply_top_p(&mut probs, 0.7);
        assert!(probs[0] > 0.0 && probs[1] > 0.0);
        assert!(probs[2] == 0.0 && probs[3] == 0.0);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_top_k_and_min_p() {
        let mut probs = vec![0.1, 0.4, 0.3, 0.2];
        apply_top_k(&mut probs, 2);
        assert_eq!(probs.iter().filter(|p| **p > 0.0).count(), 2);
        assert!(probs[1] > probs[2]);

        let mut probs = vec![0.6, 0.3, 0.05, 0.05];
        apply_min_p(&mut probs, 0.1);
        assert_eq!(probs[2], 0.0);
        assert!(probs[1] > 0.0);
    }

    #[test]
    fn test_greedy_and_seeded_sampling() {
        let params = SamplingParams { temperature: 0.0, ..SamplingParams::default() };
        let mut sampler = Sampler::new(params, Some(1));
        assert_eq!(sampler.sample(&mut [0.1, 3.0, 0.2], None), 1);

        let logits = vec![0.5, 0.2, 0.9, 0.1, 0.4];
        let draw = |seed| {
            let mut s = Sampler::new(SamplingParams::default(), Some(seed));
            (0..16).map(|_| s.sample(&mut logits.clone(), Some(&[2, 2][..]))).collect::<Vec<_>>()
        };
        assert_eq!(draw(7), draw(7));
    }

    #[test]
    fn test_validate() {
        assert!(SamplingParams::default().validate().is_ok());
        let bad = SamplingParams { repetition_penalty_window: 0, ..SamplingParams::default() };
        assert!(bad.validate().is_err());
        let bad = SamplingParams { top_p: 1.5, ..SamplingParams::default() };
        assert!(bad.validate().is_err());
    }
}
