//! Deterministic discrete-event simulation of a whole federation.
//!
//! One coordinator and its clients share a virtual clock. Every message goes
//! through the wire codec and a [`NetworkModel`] that delays, drops or
//! silences it, so a run exercises the same paths as a real deployment while
//! staying reproducible for a given seed.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    client::ClientAgent,
    config::Config,
    coordinator::{Advance, Coordinator, Receipt, RoundState, RoundTiming},
    error::{FedAvgError, Result},
    message::{ClientId, Message},
    model::LinearModel,
    observer::Observer,
    scheduler::{Scheduler, TimerId},
};

/// A participant of the simulated federation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Coordinator,
    Client(ClientId),
}

#[derive(Debug)]
enum SimEvent {
    AdvanceRound,
    Train(ClientId),
    Deliver { to: Node, payload: Vec<u8> },
}

/// How the simulated network treats datagrams.
#[derive(Debug, Clone)]
pub struct NetworkModel {
    latency: Duration,
    loss_probability: f64,
    rng: StdRng,
    silent: BTreeSet<ClientId>,
}

impl NetworkModel {
    /// A network delivering after `latency` and dropping each datagram with
    /// `loss_probability`, clamped to `[0, 1]`.
    pub fn new(latency: Duration, loss_probability: f64, seed: u64) -> Self {
        Self {
            latency,
            loss_probability: loss_probability.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
            silent: BTreeSet::new(),
        }
    }

    /// A network that never drops.
    pub fn reliable(latency: Duration) -> Self {
        Self::new(latency, 0.0, 0)
    }

    /// Marks clients whose reports never leave them. They still receive and
    /// train on every broadcast.
    pub fn with_silent(mut self, clients: impl IntoIterator<Item = ClientId>) -> Self {
        self.silent.extend(clients);
        self
    }

    fn is_silent(&self, client: ClientId) -> bool {
        self.silent.contains(&client)
    }

    fn drops(&mut self) -> bool {
        self.loss_probability > 0.0 && self.rng.random_bool(self.loss_probability)
    }
}

/// Datagram and protocol counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub silenced: u64,
    pub undecodable: u64,
    pub stale_updates: u64,
    pub aggregations: u64,
    pub skipped_aggregations: u64,
}

/// Outcome of [`Simulation::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub state: RoundState,
    pub global_weights: Vec<f64>,
    pub elapsed: Duration,
    pub stats: SimulationStats,
}

pub struct Simulation {
    scheduler: Scheduler<SimEvent>,
    coordinator: Coordinator,
    clients: BTreeMap<ClientId, ClientAgent>,
    timing: RoundTiming,
    network: NetworkModel,
    round_timer: Option<TimerId>,
    stats: SimulationStats,
}

impl Simulation {
    /// Creates a simulation whose first round starts after
    /// `timing.start_delay`.
    ///
    /// # Arguments
    /// * `coordinator` - An idle coordinator.
    /// * `clients` - The participating clients, keyed by their own ids.
    /// * `timing` - The coordinator's round timing.
    /// * `network` - The network every message goes through.
    pub fn new(
        coordinator: Coordinator,
        clients: impl IntoIterator<Item = ClientAgent>,
        timing: RoundTiming,
        network: NetworkModel,
    ) -> Self {
        let clients = clients.into_iter().map(|c| (c.id(), c)).collect();
        let mut scheduler = Scheduler::new();
        let round_timer = Some(scheduler.schedule(timing.start_delay, SimEvent::AdvanceRound));

        Self {
            scheduler,
            coordinator,
            clients,
            timing,
            network,
            round_timer,
            stats: SimulationStats::default(),
        }
    }

    /// Builds the whole federation described by `config`, with synthetic
    /// data for every client.
    ///
    /// # Errors
    /// `Config` if the configuration is invalid.
    pub fn from_config(config: &Config, observer: Arc<dyn Observer>) -> Result<Self> {
        config.validate()?;

        let sim = &config.simulation;
        let hp = config.model;
        let global_seed = config.coordinator.seed.unwrap_or(sim.seed);
        let coordinator = Coordinator::new(
            config.coordinator.num_clients,
            config.coordinator.max_rounds,
            LinearModel::new(hp, global_seed),
            Arc::clone(&observer),
        );

        let schedule = config.training_schedule()?;
        let clients = (0..config.coordinator.num_clients as ClientId)
            .map(|id| -> Result<ClientAgent> {
                let data = config.data.generate(id, hp.input_dimension)?;
                let model = LinearModel::new(hp, sim.seed.wrapping_add(1 + u64::from(id)));
                Ok(ClientAgent::new(id, model, data, schedule, Arc::clone(&observer)))
            })
            .collect::<Result<Vec<_>>>()?;

        let latency = Duration::try_from_secs_f64(sim.latency_secs)
            .map_err(|_| FedAvgError::Config(format!("invalid latency {}", sim.latency_secs)))?;
        let network = NetworkModel::new(latency, sim.loss_probability, sim.seed)
            .with_silent(sim.silent_clients.iter().copied());

        Ok(Self::new(coordinator, clients, config.round_timing()?, network))
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientAgent> {
        self.clients.get(&id)
    }

    pub fn stats(&self) -> SimulationStats {
        self.stats
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending()
    }

    /// Whether a round-advance timer is armed.
    pub fn round_timer_armed(&self) -> bool {
        self.round_timer
            .is_some_and(|id| self.scheduler.is_pending(id))
    }

    /// Processes the next event.
    ///
    /// # Returns
    /// `false` once there is nothing left to process.
    pub fn step(&mut self) -> bool {
        let Some((_, event)) = self.scheduler.next() else {
            return false;
        };

        match event {
            SimEvent::AdvanceRound => self.advance_round(),
            SimEvent::Train(client) => self.train(client),
            SimEvent::Deliver { to, payload } => self.deliver(to, &payload),
        }

        true
    }

    /// Runs until every timer has fired and every datagram has landed.
    pub fn run(&mut self) -> SimulationReport {
        while self.step() {}

        let report = SimulationReport {
            state: self.coordinator.state(),
            global_weights: self.coordinator.global_model().weights().to_vec(),
            elapsed: self.now(),
            stats: self.stats,
        };

        info!(
            "simulation finished at {:?}: {} aggregations, {} sent, {} dropped",
            report.elapsed, report.stats.aggregations, report.stats.sent, report.stats.dropped
        );
        report
    }

    /// Cancels every outstanding timer and in-flight datagram.
    pub fn shutdown(&mut self) {
        self.scheduler.clear();
        self.round_timer = None;
    }

    fn advance_round(&mut self) {
        self.round_timer = None;

        match self.coordinator.advance() {
            Advance::Started(update) => {
                let round = update.round_id;
                match Message::from(update).encode() {
                    Ok(payload) => {
                        let ids: Vec<_> = self.clients.keys().copied().collect();
                        for id in ids {
                            self.send(Node::Client(id), payload.clone());
                        }
                    }
                    Err(e) => warn!("cannot encode global model for round {round}: {e}"),
                }
                self.arm_round_timer();
            }
            Advance::Completed { rounds } => {
                debug!("coordinator completed {rounds} rounds at {:?}", self.now());
            }
        }
    }

    fn arm_round_timer(&mut self) {
        if let Some(previous) = self.round_timer.take() {
            self.scheduler.cancel(previous);
        }
        let id = self
            .scheduler
            .schedule(self.timing.round_interval, SimEvent::AdvanceRound);
        self.round_timer = Some(id);
    }

    fn train(&mut self, id: ClientId) {
        let Some(update) = self.clients.get_mut(&id).and_then(ClientAgent::train_and_report) else {
            return;
        };

        if self.network.is_silent(id) {
            debug!("client {id} is silent, its round {} report is lost", update.round_id);
            self.stats.silenced += 1;
            return;
        }

        match Message::from(update).encode() {
            Ok(payload) => self.send(Node::Coordinator, payload),
            Err(e) => warn!("client {id} cannot encode its update: {e}"),
        }
    }

    fn send(&mut self, to: Node, payload: Vec<u8>) {
        self.stats.sent += 1;

        if self.network.drops() {
            debug!("datagram to {to:?} lost");
            self.stats.dropped += 1;
            return;
        }

        self.scheduler
            .schedule(self.network.latency, SimEvent::Deliver { to, payload });
    }

    fn deliver(&mut self, to: Node, payload: &[u8]) {
        self.stats.delivered += 1;

        let msg = match Message::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping undecodable datagram to {to:?}: {e}");
                self.stats.undecodable += 1;
                return;
            }
        };

        match (to, msg) {
            (Node::Coordinator, Message::LocalUpdate(update)) => {
                match self.coordinator.handle_local_update(update) {
                    Ok(Receipt::Aggregated(_)) => self.stats.aggregations += 1,
                    Ok(Receipt::Skipped(_)) => self.stats.skipped_aggregations += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("discarding update: {e}");
                        self.stats.stale_updates += 1;
                    }
                }
            }
            (Node::Client(id), Message::GlobalUpdate(update)) => {
                let Some(client) = self.clients.get_mut(&id) else {
                    warn!("no client {id} to deliver round {} to", update.round_id);
                    return;
                };

                if let Some(delay) = client.on_global_update(&update) {
                    self.scheduler.schedule(delay, SimEvent::Train(id));
                }
            }
            (to, msg) => warn!("{to:?} ignoring unexpected {} message", msg.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::TrainingSchedule, data::SyntheticData, model::Hyperparams,
        observer::NoopObserver,
    };

    fn timing() -> RoundTiming {
        RoundTiming {
            start_delay: Duration::from_secs(1),
            round_interval: Duration::from_secs(5),
        }
    }

    fn simulation(num_clients: u32, max_rounds: u32, network: NetworkModel) -> Simulation {
        let hp = Hyperparams {
            input_dimension: 3,
            ..Hyperparams::default()
        };
        let observer: Arc<dyn Observer> = Arc::new(NoopObserver);
        let data = SyntheticData::default();

        let coordinator = Coordinator::new(
            num_clients as usize,
            max_rounds,
            LinearModel::new(hp, 0),
            Arc::clone(&observer),
        );
        let clients = (0..num_clients).map(|id| {
            ClientAgent::new(
                id,
                LinearModel::new(hp, 1 + u64::from(id)),
                data.generate(id, 3).unwrap(),
                TrainingSchedule::default(),
                Arc::clone(&observer),
            )
        });

        Simulation::new(coordinator, clients, timing(), network)
    }

    #[test]
    fn reliable_run_aggregates_every_round() {
        let mut sim = simulation(3, 4, NetworkModel::reliable(Duration::from_millis(10)));
        let report = sim.run();

        assert_eq!(report.state, RoundState::Completed);
        assert_eq!(report.stats.aggregations, 4);
        assert_eq!(report.stats.dropped, 0);
        assert_eq!(report.stats.stale_updates, 0);
        // 4 rounds x 3 broadcasts + 4 rounds x 3 reports
        assert_eq!(report.stats.sent, 24);
        assert_eq!(report.elapsed, Duration::from_secs(21));
    }

    #[test]
    fn silent_client_blocks_aggregation() {
        let network = NetworkModel::reliable(Duration::from_millis(10)).with_silent([1]);
        let mut sim = simulation(3, 2, network);
        let initial = sim.coordinator().global_model().weights().to_vec();

        let report = sim.run();
        assert_eq!(report.stats.aggregations, 0);
        assert_eq!(report.stats.silenced, 2);
        assert_eq!(report.global_weights, initial);
        assert_eq!(report.state, RoundState::Completed);
    }

    #[test]
    fn only_one_round_timer_is_ever_armed() {
        let mut sim = simulation(2, 3, NetworkModel::reliable(Duration::from_millis(10)));
        assert!(sim.round_timer_armed());

        while sim.step() {
            let armed = sim
                .scheduler
                .iter()
                .filter(|e| matches!(e, SimEvent::AdvanceRound))
                .count();
            assert!(armed <= 1);
        }
        assert!(!sim.round_timer_armed());
    }

    #[test]
    fn late_reports_are_stale() {
        let network = NetworkModel::reliable(Duration::from_secs(3));
        let mut sim = simulation(2, 2, network);
        let report = sim.run();

        // reports need 3s + 0.1s + 3s, beyond the 5s round
        assert_eq!(report.stats.aggregations, 0);
        assert!(report.stats.stale_updates > 0);
    }

    #[test]
    fn shutdown_cancels_everything() {
        let mut sim = simulation(2, 3, NetworkModel::reliable(Duration::from_millis(10)));
        sim.step();
        assert!(sim.pending_timers() > 0);

        sim.shutdown();
        assert_eq!(sim.pending_timers(), 0);
        assert!(!sim.round_timer_armed());
        assert!(!sim.step());
        assert_eq!(sim.coordinator().current_round(), Some(1));
    }

    #[test]
    fn total_loss_never_starts_training() {
        let mut sim = simulation(2, 2, NetworkModel::new(Duration::ZERO, 1.0, 9));
        let report = sim.run();

        assert_eq!(report.stats.delivered, 0);
        assert_eq!(report.stats.dropped, report.stats.sent);
        assert_eq!(sim.client(0).unwrap().current_round(), None);
    }

    #[test]
    fn builds_from_config() {
        let mut config = Config::default();
        config.coordinator.num_clients = 2;
        config.coordinator.max_rounds = 2;

        let mut sim = Simulation::from_config(&config, Arc::new(NoopObserver)).unwrap();
        assert_eq!(sim.client(1).unwrap().sample_count(), 120);
        assert_eq!(sim.run().stats.aggregations, 2);
    }
}
