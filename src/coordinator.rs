//! The coordinator's round state machine.
//!
//! The state machine is transport and timer agnostic: callers feed it the
//! round timer firing ([`Coordinator::advance`]) and inbound local updates
//! ([`Coordinator::handle_local_update`]) and act on what it returns.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use log::{debug, info, warn};

use crate::{
    aggregation::{self, Contribution},
    error::{FedAvgError, Result},
    message::{ClientId, GlobalUpdate, LocalUpdate},
    model::{self, LinearModel},
    observer::{Event, Observer},
};

/// Where the coordinator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Idle,
    Active(u32),
    Completed,
}

/// When rounds start and how long each one lasts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundTiming {
    pub start_delay: Duration,
    pub round_interval: Duration,
}

/// What the coordinator did when its round timer fired.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// A new round began; broadcast `update` to every client and rearm the timer.
    Started(GlobalUpdate),
    /// The last round elapsed, nothing else will be broadcast.
    Completed { rounds: u32 },
}

/// What happened to an accepted local update.
#[derive(Debug)]
pub enum Receipt {
    /// Recorded, still waiting for more clients.
    Pending { received: usize, expected: usize },
    /// Recorded and the round was aggregated into the global model.
    Aggregated(AggregationSummary),
    /// Recorded, the round was complete but had nothing usable.
    Skipped(FedAvgError),
    /// Recorded after the round was already aggregated, nothing else happened.
    Late,
}

/// Outcome of a successful aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSummary {
    pub round: u32,
    pub contributors: usize,
    pub total_samples: u64,
}

/// Updates accumulated during a single round.
#[derive(Debug, Clone, Default)]
pub struct RoundRecord {
    round_id: u32,
    weights: BTreeMap<ClientId, String>,
    samples: BTreeMap<ClientId, u64>,
    aggregated: bool,
}

impl RoundRecord {
    fn reset(&mut self, round_id: u32) {
        self.round_id = round_id;
        self.weights.clear();
        self.samples.clear();
        self.aggregated = false;
    }

    fn insert(&mut self, client: ClientId, weights: String, samples: u64) {
        self.weights.insert(client, weights);
        self.samples.insert(client, samples);
    }

    pub fn round_id(&self) -> u32 {
        self.round_id
    }

    /// Amount of distinct clients recorded this round.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.weights.contains_key(&client)
    }

    pub fn samples_of(&self, client: ClientId) -> Option<u64> {
        self.samples.get(&client).copied()
    }

    pub fn is_aggregated(&self) -> bool {
        self.aggregated
    }
}

/// Drives rounds and aggregates the clients' local models.
pub struct Coordinator {
    state: RoundState,
    max_rounds: u32,
    num_clients: usize,
    global_model: LinearModel,
    record: RoundRecord,
    observer: Arc<dyn Observer>,
}

impl Coordinator {
    /// Creates a new idle coordinator.
    ///
    /// # Arguments
    /// * `num_clients` - Distinct clients needed before a round is aggregated.
    /// * `max_rounds` - The amount of rounds to run.
    /// * `global_model` - The initial global model.
    /// * `observer` - Sink for round telemetry.
    pub fn new(
        num_clients: usize,
        max_rounds: u32,
        global_model: LinearModel,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            state: RoundState::Idle,
            max_rounds,
            num_clients,
            global_model,
            record: RoundRecord::default(),
            observer,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    /// The active round, if any.
    pub fn current_round(&self) -> Option<u32> {
        match self.state {
            RoundState::Active(round) => Some(round),
            _ => None,
        }
    }

    pub fn num_clients(&self) -> usize {
        self.num_clients
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn global_model(&self) -> &LinearModel {
        &self.global_model
    }

    /// Mutable access to the global model, e.g. to seed known weights.
    pub fn global_model_mut(&mut self) -> &mut LinearModel {
        &mut self.global_model
    }

    pub fn record(&self) -> &RoundRecord {
        &self.record
    }

    /// Handles the round timer firing.
    ///
    /// Moves to the next round regardless of whether the current one was
    /// aggregated, or to `Completed` past `max_rounds`. Once completed it
    /// keeps returning `Completed`.
    pub fn advance(&mut self) -> Advance {
        let next = match self.state {
            RoundState::Idle => 1,
            RoundState::Active(round) => round + 1,
            RoundState::Completed => {
                return Advance::Completed {
                    rounds: self.max_rounds,
                }
            }
        };

        if next > self.max_rounds {
            let rounds = next - 1;
            self.state = RoundState::Completed;
            info!("federated learning completed after {rounds} rounds");
            self.observer.observe(Event::Completed { rounds });
            return Advance::Completed { rounds };
        }

        self.state = RoundState::Active(next);
        self.record.reset(next);

        info!("starting round {next}/{}", self.max_rounds);
        self.observer.observe(Event::RoundStarted { round: next });

        Advance::Started(GlobalUpdate::new(next, self.global_model.serialize()))
    }

    /// Records a client's local update and aggregates once every client has
    /// reported for the current round.
    ///
    /// # Errors
    /// `StaleRound` if the update is not for the active round; the round's
    /// accumulated state is left untouched.
    pub fn handle_local_update(&mut self, update: LocalUpdate) -> Result<Receipt> {
        let current = self.current_round();
        if current != Some(update.round_id) {
            return Err(FedAvgError::StaleRound {
                current,
                got: update.round_id,
            });
        }

        let round = update.round_id;
        let client = update.client_id;
        debug!(
            "received model update from client {client} for round {round}: samples={}",
            update.sample_count
        );

        if let Some(accuracy) = update.reported_accuracy() {
            self.observer.observe(Event::ClientAccuracy {
                round,
                client,
                accuracy,
            });
        }

        self.record.insert(client, update.weights, update.sample_count);

        if self.record.aggregated {
            debug!("client {client} reported after round {round} was aggregated");
            return Ok(Receipt::Late);
        }

        let received = self.record.len();
        if received < self.num_clients {
            return Ok(Receipt::Pending {
                received,
                expected: self.num_clients,
            });
        }

        info!("received models from all {received} clients, aggregating round {round}");
        self.record.aggregated = true;

        Ok(match self.aggregate() {
            Ok(summary) => Receipt::Aggregated(summary),
            Err(e) => {
                warn!("{e}");
                Receipt::Skipped(e)
            }
        })
    }

    /// Replaces the global model with the sample-weighted average of the
    /// models recorded this round.
    ///
    /// Clients whose weights cannot be parsed are left out of the average
    /// entirely, samples included.
    ///
    /// # Errors
    /// `AggregationSkipped` if nothing usable was recorded, in which case the
    /// global model is unchanged.
    pub fn aggregate(&mut self) -> Result<AggregationSummary> {
        let round = self.record.round_id;
        let expected = self.global_model.num_weights();

        let mut contributions = Vec::with_capacity(self.record.len());
        for (client, text) in &self.record.weights {
            let samples = self.record.samples.get(client).copied().unwrap_or_default();
            match model::parse_weights(text, expected) {
                Ok(weights) => contributions.push(Contribution { weights, samples }),
                Err(e) => warn!("dropping client {client} from round {round}: {e}"),
            }
        }

        let averaged = aggregation::weighted_average(round, &contributions)?;
        self.global_model.set_weights(averaged)?;

        let summary = AggregationSummary {
            round,
            contributors: contributions.len(),
            total_samples: aggregation::total_samples(&contributions).unwrap_or(u64::MAX),
        };

        info!(
            "aggregated {} models for round {round} over {} samples",
            summary.contributors, summary.total_samples
        );
        self.observer.observe(Event::RoundAggregated {
            round,
            contributors: summary.contributors,
            total_samples: summary.total_samples,
        });

        Ok(summary)
    }
}
