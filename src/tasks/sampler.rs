//! Recency-biased selection of buckets and the pacing between downloads.

use std::time::Duration;

use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;

use crate::config::ThrottleOptions;

/// `weight[i] = (i / n) ^ (1 - recency_bias)` for buckets ordered oldest to
/// newest. A bias of 1 makes every weight `0^0 = 1`.
pub fn bucket_weights(count: usize, recency_bias: f64) -> Vec<f64> {
    let exponent = 1.0 - recency_bias;
    (0..count)
        .map(|i| (i as f64 / count as f64).powf(exponent))
        .collect()
}

/// [`bucket_weights`] scaled to sum to 1. An all-zero vector (a single
/// bucket with a bias below 1) becomes uniform.
pub fn normalized_weights(count: usize, recency_bias: f64) -> Vec<f64> {
    let weights = bucket_weights(count, recency_bias);
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        weights.into_iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / count as f64; count]
    }
}

/// Weighted draws over the buckets that still hold unattempted photos.
#[derive(Debug, Clone)]
pub struct BucketSampler {
    weights: Vec<f64>,
    active: Vec<bool>,
}

impl BucketSampler {
    pub fn new(bucket_count: usize, recency_bias: f64) -> Self {
        Self {
            weights: normalized_weights(bucket_count, recency_bias),
            active: vec![true; bucket_count],
        }
    }

    pub fn remaining(&self) -> usize {
        self.active.iter().filter(|active| **active).count()
    }

    pub fn retire(&mut self, bucket: usize) {
        if let Some(active) = self.active.get_mut(bucket) {
            *active = false;
        }
    }

    /// Index of the next bucket, or `None` once every bucket is retired.
    /// Falls back to a uniform draw when all remaining weights are zero.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        let candidates: Vec<usize> = (0..self.active.len()).filter(|&i| self.active[i]).collect();
        if candidates.is_empty() {
            return None;
        }
        let weights = candidates.iter().map(|&i| self.weights[i]);
        let pick = match WeightedIndex::new(weights) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.random_range(0..candidates.len()),
        };
        Some(candidates[pick])
    }
}

/// `max(min_delay, cached / divisor seconds)`, stretched by a random factor
/// in `[1, 2)`.
pub fn throttle_delay<R: Rng + ?Sized>(
    cached_files: usize,
    options: &ThrottleOptions,
    rng: &mut R,
) -> Duration {
    let divisor = options.divisor.max(1) as u64;
    let base = Duration::from_secs(cached_files as u64 / divisor).max(options.min_delay);
    base.mul_f64(1.0 + rng.random::<f64>())
}
