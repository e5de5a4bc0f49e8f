//! Pure vector numerics for Re-ID scoring and profile maintenance.
//!
//! Scoring is a function of (query, candidate, weights) and the profile
//! update a function of (old, new, alpha); persistence happens elsewhere.

/// L2 norm of a vector.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale a vector to unit length. A zero vector is returned unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let n = norm(&v);
    if n > 0.0 {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
    v
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = norm(a);
    let norm_b = norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Exponential moving average of a profile embedding towards a new
/// observation: `normalise((1 - alpha) * old + alpha * new)`.
pub fn ema_update(old: &[f32], new: &[f32], alpha: f32) -> Vec<f32> {
    let blended: Vec<f32> = old
        .iter()
        .zip(new.iter())
        .map(|(o, n)| (1.0 - alpha) * o + alpha * n)
        .collect();
    l2_normalize(blended)
}

/// Scoring weights for one primary extractor plus zero or more auxiliaries.
/// Weights must sum to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleWeights(Vec<f32>);

impl EnsembleWeights {
    /// Single-model scoring: the primary similarity is the score.
    pub fn single() -> Self {
        Self(vec![1.0])
    }

    pub fn new(weights: Vec<f32>) -> Result<Self, String> {
        if weights.is_empty() {
            return Err("ensemble weights must not be empty".to_string());
        }
        let sum: f32 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(format!("ensemble weights must sum to 1, got {sum}"));
        }
        if weights.iter().any(|w| *w < 0.0) {
            return Err("ensemble weights must be non-negative".to_string());
        }
        Ok(Self(weights))
    }

    /// Parse a comma-separated list, e.g. "0.6,0.4".
    pub fn parse(s: &str) -> Result<Self, String> {
        let weights: Result<Vec<f32>, _> = s
            .split(',')
            .map(|p| p.trim().parse::<f32>().map_err(|e| e.to_string()))
            .collect();
        Self::new(weights?)
    }

    /// Number of auxiliary extractors this configuration expects.
    pub fn aux_count(&self) -> usize {
        self.0.len() - 1
    }

    pub fn weights(&self) -> &[f32] {
        &self.0
    }
}

/// Weighted ensemble score. `aux_sims` must supply one similarity per
/// auxiliary weight; missing auxiliaries contribute nothing (their weight is
/// forfeited rather than redistributed).
pub fn ensemble_score(primary_sim: f32, aux_sims: &[f32], weights: &EnsembleWeights) -> f32 {
    let w = weights.weights();
    let mut score = w[0] * primary_sim;
    for (i, sim) in aux_sims.iter().enumerate() {
        if let Some(weight) = w.get(i + 1) {
            score += weight * sim;
        }
    }
    score
}
