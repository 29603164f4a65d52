//! The client side of a round: receive the global model, train, report back.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};

use crate::{
    data::TrainingSample,
    message::{ClientId, GlobalUpdate, LocalUpdate},
    model::LinearModel,
    observer::{Event, Observer},
};

/// How long a client waits after a broadcast before it trains.
///
/// Clients are staggered by id so their reports don't all land at once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSchedule {
    pub base: Duration,
    pub stagger: Duration,
}

impl Default for TrainingSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            stagger: Duration::from_millis(50),
        }
    }
}

impl TrainingSchedule {
    /// `base + stagger * client`, or just `base` if that overflows.
    pub fn delay_for(&self, client: ClientId) -> Duration {
        self.stagger
            .checked_mul(client)
            .and_then(|stagger| self.base.checked_add(stagger))
            .unwrap_or(self.base)
    }
}

/// A client's round state and private data.
pub struct ClientAgent {
    id: ClientId,
    current_round: Option<u32>,
    training_in_progress: bool,
    model: LinearModel,
    data: Vec<TrainingSample>,
    schedule: TrainingSchedule,
    observer: Arc<dyn Observer>,
}

impl ClientAgent {
    /// Creates a new client agent.
    ///
    /// # Arguments
    /// * `id` - The client's id.
    /// * `model` - The local model, overwritten by every broadcast.
    /// * `data` - The client's private training set.
    /// * `schedule` - When to train after a broadcast.
    /// * `observer` - Sink for training telemetry.
    pub fn new(
        id: ClientId,
        model: LinearModel,
        data: Vec<TrainingSample>,
        schedule: TrainingSchedule,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            id,
            current_round: None,
            training_in_progress: false,
            model,
            data,
            schedule,
            observer,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn current_round(&self) -> Option<u32> {
        self.current_round
    }

    pub fn is_training(&self) -> bool {
        self.training_in_progress
    }

    pub fn model(&self) -> &LinearModel {
        &self.model
    }

    pub fn sample_count(&self) -> usize {
        self.data.len()
    }

    /// Adopts the broadcast global model.
    ///
    /// # Returns
    /// The delay after which [`ClientAgent::train_and_report`] must run, or
    /// `None` if no training should be scheduled for this update: either
    /// the weights could not be read or a training is already pending.
    pub fn on_global_update(&mut self, update: &GlobalUpdate) -> Option<Duration> {
        self.current_round = Some(update.round_id);

        if let Err(e) = self.model.deserialize(&update.weights) {
            warn!(
                "client {} ignoring global model for round {}: {e}",
                self.id, update.round_id
            );
            return None;
        }

        if self.training_in_progress {
            debug!(
                "client {} already training, round {} only refreshed the model",
                self.id, update.round_id
            );
            return None;
        }

        self.training_in_progress = true;
        Some(self.schedule.delay_for(self.id))
    }

    /// Trains on the private data and builds the report for the coordinator.
    ///
    /// Always clears the in-progress flag. Returns `None` when there is
    /// nothing to report: no round seen yet, no data or a failed training.
    pub fn train_and_report(&mut self) -> Option<LocalUpdate> {
        self.training_in_progress = false;

        let Some(round) = self.current_round else {
            warn!("client {} asked to train before any round started", self.id);
            return None;
        };

        if self.data.is_empty() {
            warn!("client {} has no training data, skipping round {round}", self.id);
            return None;
        }

        if let Err(e) = self.model.train(&self.data) {
            warn!("client {} failed to train for round {round}: {e}", self.id);
            return None;
        }

        let accuracy = match self.model.mean_absolute_error(&self.data) {
            Ok(Some(mae)) => 1.0 / (1.0 + mae),
            Ok(None) => 0.0,
            Err(e) => {
                warn!("client {} failed to evaluate for round {round}: {e}", self.id);
                0.0
            }
        };

        info!(
            "client {} finished training for round {round} on {} samples, accuracy {accuracy:.4}",
            self.id,
            self.data.len()
        );
        self.observer.observe(Event::TrainingCompleted {
            round,
            client: self.id,
            accuracy,
        });

        Some(LocalUpdate {
            round_id: round,
            client_id: self.id,
            weights: self.model.serialize(),
            sample_count: self.data.len() as u64,
            accuracy,
        })
    }
}
