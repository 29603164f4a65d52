//! The linear regressor trained by every participant.
//!
//! Weights are stored bias first: `weights[0]` is the bias and
//! `weights[1..=input_dimension]` are the feature weights.

use std::num::NonZeroUsize;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    data::TrainingSample,
    error::{FedAvgError, Result},
};

const WEIGHT_SEPARATOR: &str = ";";
const INIT_RANGE: f64 = 0.1;

/// Training hyperparameters, fixed when the model is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparams {
    pub input_dimension: usize,
    pub learning_rate: f64,
    pub batch_size: NonZeroUsize,
    pub num_epochs: usize,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            input_dimension: 5,
            learning_rate: 0.01,
            batch_size: NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN),
            num_epochs: 3,
        }
    }
}

impl Hyperparams {
    /// Amount of weights a model with these hyperparameters holds.
    pub fn num_weights(&self) -> usize {
        self.input_dimension + 1
    }
}

/// A linear model trained with mini-batch gradient descent on squared error.
#[derive(Debug, Clone)]
pub struct LinearModel {
    weights: Vec<f64>,
    hyperparams: Hyperparams,
    rng: StdRng,
}

impl LinearModel {
    /// Creates a new model with random weights drawn from a seeded generator.
    ///
    /// # Arguments
    /// * `hyperparams` - The training hyperparameters.
    /// * `seed` - Seed for the weight initialization.
    pub fn new(hyperparams: Hyperparams, seed: u64) -> Self {
        Self::with_rng(hyperparams, StdRng::seed_from_u64(seed))
    }

    /// Creates a new model seeded from the operating system.
    pub fn from_entropy(hyperparams: Hyperparams) -> Self {
        Self::with_rng(hyperparams, StdRng::from_os_rng())
    }

    /// Creates a new model whose weights are drawn from `rng`.
    pub fn with_rng(hyperparams: Hyperparams, rng: StdRng) -> Self {
        let mut model = Self {
            weights: vec![0.0; hyperparams.num_weights()],
            hyperparams,
            rng,
        };

        model.initialize_weights();
        model
    }

    /// Refills every weight with an independent value in `[-0.1, 0.1]`.
    pub fn initialize_weights(&mut self) {
        let len = self.hyperparams.num_weights();
        let Self { weights, rng, .. } = self;
        weights.resize(len, 0.0);
        weights
            .iter_mut()
            .for_each(|w| *w = rng.random_range(-INIT_RANGE..=INIT_RANGE));
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn hyperparams(&self) -> &Hyperparams {
        &self.hyperparams
    }

    pub fn input_dimension(&self) -> usize {
        self.hyperparams.input_dimension
    }

    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    /// Predicts the target for `features`.
    ///
    /// # Errors
    /// `DimensionMismatch` if `features` is not `input_dimension` long.
    pub fn predict(&self, features: &[f64]) -> Result<f64> {
        self.check_features(features)?;
        Ok(self.forward(features))
    }

    /// Runs `num_epochs` passes of mini-batch gradient descent over `samples`.
    ///
    /// Batches follow sample order and are never shuffled, so training is
    /// reproducible. An empty sample set leaves the weights untouched.
    ///
    /// # Errors
    /// `DimensionMismatch` if any sample has the wrong amount of features, in
    /// which case no weight is modified.
    pub fn train(&mut self, samples: &[TrainingSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        samples
            .iter()
            .try_for_each(|sample| self.check_features(&sample.features))?;

        let batch_size = self.hyperparams.batch_size.get();
        let lr = self.hyperparams.learning_rate;
        let mut grad = vec![0.0; self.weights.len()];

        for _ in 0..self.hyperparams.num_epochs {
            for batch in samples.chunks(batch_size) {
                grad.iter_mut().for_each(|g| *g = 0.0);

                for sample in batch {
                    let error = self.forward(&sample.features) - sample.target;
                    grad[0] += error;
                    grad[1..]
                        .iter_mut()
                        .zip(&sample.features)
                        .for_each(|(g, x)| *g += error * x);
                }

                let scale = lr / batch.len() as f64;
                self.weights
                    .iter_mut()
                    .zip(&grad)
                    .for_each(|(w, g)| *w -= scale * g);
            }
        }

        Ok(())
    }

    /// Mean absolute prediction error over `samples`, `None` if there are none.
    ///
    /// # Errors
    /// `DimensionMismatch` if any sample has the wrong amount of features.
    pub fn mean_absolute_error(&self, samples: &[TrainingSample]) -> Result<Option<f64>> {
        if samples.is_empty() {
            return Ok(None);
        }

        let mut total = 0.0;
        for sample in samples {
            total += (self.predict(&sample.features)? - sample.target).abs();
        }

        Ok(Some(total / samples.len() as f64))
    }

    /// Replaces the weights with `weights`.
    ///
    /// # Errors
    /// `DimensionMismatch` if the length differs from the current weights.
    pub fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        if weights.len() != self.weights.len() {
            return Err(FedAvgError::DimensionMismatch {
                expected: self.weights.len(),
                got: weights.len(),
            });
        }

        self.weights = weights;
        Ok(())
    }

    /// Renders the weights as `;`-joined decimal text.
    ///
    /// Uses the shortest representation that parses back to the same `f64`.
    pub fn serialize(&self) -> String {
        self.weights
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(WEIGHT_SEPARATOR)
    }

    /// Replaces the weights with the ones encoded in `text`.
    ///
    /// # Errors
    /// `Serialization` if a token is not a finite number or the amount of
    /// weights is wrong; the model is left unchanged.
    pub fn deserialize(&mut self, text: &str) -> Result<()> {
        self.weights = parse_weights(text, self.weights.len())?;
        Ok(())
    }

    fn check_features(&self, features: &[f64]) -> Result<()> {
        let expected = self.hyperparams.input_dimension;
        if features.len() != expected {
            return Err(FedAvgError::DimensionMismatch {
                expected,
                got: features.len(),
            });
        }

        Ok(())
    }

    fn forward(&self, features: &[f64]) -> f64 {
        self.weights[0]
            + self.weights[1..]
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>()
    }
}

/// Parses `;`-joined weights, requiring exactly `expected` finite values.
///
/// # Errors
/// `Serialization` on a malformed token or a wrong amount of values.
pub fn parse_weights(text: &str, expected: usize) -> Result<Vec<f64>> {
    let weights = text
        .split(WEIGHT_SEPARATOR)
        .map(|token| {
            let token = token.trim();
            match token.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(value),
                _ => Err(FedAvgError::Serialization(format!(
                    "invalid weight token '{token}'"
                ))),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    if weights.len() != expected {
        return Err(FedAvgError::Serialization(format!(
            "expected {expected} weights, got {}",
            weights.len()
        )));
    }

    Ok(weights)
}
