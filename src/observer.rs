//! Telemetry published by the coordinator and the clients.

use log::info;
use tokio::sync::mpsc::UnboundedSender;

use crate::message::ClientId;

/// A protocol event worth reporting outside the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The coordinator broadcast the global model for `round`.
    RoundStarted { round: u32 },
    /// A client reported its local accuracy to the coordinator.
    ClientAccuracy {
        round: u32,
        client: ClientId,
        accuracy: f64,
    },
    /// The coordinator replaced the global model with the round's average.
    RoundAggregated {
        round: u32,
        contributors: usize,
        total_samples: u64,
    },
    /// A client finished local training for `round`.
    TrainingCompleted {
        round: u32,
        client: ClientId,
        accuracy: f64,
    },
    /// The coordinator ran its last round.
    Completed { rounds: u32 },
}

/// Receives protocol events. Implementations must not block.
pub trait Observer: Send + Sync {
    fn observe(&self, event: Event);
}

impl<F> Observer for F
where
    F: Fn(Event) + Send + Sync,
{
    fn observe(&self, event: Event) {
        self(event)
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn observe(&self, _event: Event) {}
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn observe(&self, event: Event) {
        match event {
            Event::RoundStarted { round } => info!(round = round; "round started"),
            Event::ClientAccuracy {
                round,
                client,
                accuracy,
            } => info!(round = round, client = client, accuracy = accuracy; "client accuracy"),
            Event::RoundAggregated {
                round,
                contributors,
                total_samples,
            } => info!(
                round = round, contributors = contributors, total_samples = total_samples;
                "round aggregated"
            ),
            Event::TrainingCompleted {
                round,
                client,
                accuracy,
            } => info!(round = round, client = client, accuracy = accuracy; "training completed"),
            Event::Completed { rounds } => info!(rounds = rounds; "federated learning completed"),
        }
    }
}

/// Forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: UnboundedSender<Event>,
}

impl ChannelObserver {
    pub fn new(tx: UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

impl Observer for ChannelObserver {
    fn observe(&self, event: Event) {
        // A closed receiver only means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}
