//! Training samples and the synthetic generator used to exercise the protocol.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::{
    error::{FedAvgError, Result},
    message::ClientId,
};

/// A single `(features, target)` pair owned by one client.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub features: Vec<f64>,
    pub target: f64,
}

impl TrainingSample {
    pub fn new(features: Vec<f64>, target: f64) -> Self {
        Self { features, target }
    }
}

/// Generates a noisy linear regression problem per client.
///
/// Every client draws from the same underlying model but with its own seed
/// and sample count, so clients hold different private datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticData {
    pub true_weights: Vec<f64>,
    pub true_bias: f64,
    pub noise_std: f64,
    pub feature_range: f64,
    pub base_samples: usize,
    pub samples_per_client: usize,
    pub seed_offset: u64,
}

impl Default for SyntheticData {
    fn default() -> Self {
        Self {
            true_weights: vec![0.5, -1.2, 0.8, 2.0, -0.7],
            true_bias: 1.0,
            noise_std: 0.5,
            feature_range: 5.0,
            base_samples: 100,
            samples_per_client: 20,
            seed_offset: 1000,
        }
    }
}

impl SyntheticData {
    /// Number of samples generated for `client_id`.
    pub fn sample_count(&self, client_id: ClientId) -> usize {
        self.base_samples + self.samples_per_client * client_id as usize
    }

    /// Generates the training set of `client_id` with `dimension` features.
    ///
    /// # Errors
    /// Returns `FedAvgError::Config` if the noise or feature range is invalid.
    pub fn generate(&self, client_id: ClientId, dimension: usize) -> Result<Vec<TrainingSample>> {
        self.validate()?;

        let noise = Normal::new(0.0, self.noise_std).map_err(|e| {
            FedAvgError::Config(format!("invalid noise deviation {}: {e}", self.noise_std))
        })?;

        let truth = self.true_weights_for(dimension);
        let mut rng = StdRng::seed_from_u64(client_id as u64 + self.seed_offset);

        let samples = (0..self.sample_count(client_id))
            .map(|_| {
                let features: Vec<f64> = (0..dimension)
                    .map(|_| rng.random_range(-self.feature_range..self.feature_range))
                    .collect();

                let target = self.true_bias
                    + features.iter().zip(&truth).map(|(x, w)| x * w).sum::<f64>()
                    + noise.sample(&mut rng);

                TrainingSample::new(features, target)
            })
            .collect();

        Ok(samples)
    }

    /// Checks the generator parameters.
    ///
    /// # Errors
    /// `Config` if the feature range is not positive or the noise deviation is
    /// negative or not finite.
    pub fn validate(&self) -> Result<()> {
        if !(self.feature_range.is_finite() && self.feature_range > 0.0) {
            return Err(FedAvgError::Config(format!(
                "feature range must be positive, got {}",
                self.feature_range
            )));
        }
        if !(self.noise_std.is_finite() && self.noise_std >= 0.0) {
            return Err(FedAvgError::Config(format!(
                "noise deviation must be non-negative, got {}",
                self.noise_std
            )));
        }
        if !(self.true_bias.is_finite() && self.true_weights.iter().all(|w| w.is_finite())) {
            return Err(FedAvgError::Config("true model must be finite".into()));
        }

        Ok(())
    }

    fn true_weights_for(&self, dimension: usize) -> Vec<f64> {
        if self.true_weights.is_empty() {
            return vec![0.0; dimension];
        }

        self.true_weights.iter().copied().cycle().take(dimension).collect()
    }
}
