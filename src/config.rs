//! JSON configuration shared by every binary mode.
//!
//! Every section and field has a default, so an empty object (or no file at
//! all) is a valid configuration for a three client run on localhost.

use std::{env, fs, path::Path, time::Duration};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    client::TrainingSchedule,
    coordinator::RoundTiming,
    data::SyntheticData,
    error::{FedAvgError, Result},
    message::ClientId,
    model::Hyperparams,
};

/// Environment variable holding the configuration path.
pub const CONFIG_ENV: &str = "FEDAVG_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: Hyperparams,
    pub coordinator: CoordinatorConfig,
    pub client: ClientConfig,
    pub simulation: SimulationConfig,
    pub data: SyntheticData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub bind: String,
    pub num_clients: usize,
    pub max_rounds: u32,
    pub start_delay_secs: f64,
    pub round_interval_secs: f64,
    /// Client endpoints indexed by client id. When empty, client `i` is
    /// expected at `127.0.0.1:{client_port_base + i}`.
    pub clients: Vec<String>,
    pub client_port_base: u16,
    /// Seed of the initial global model, random when absent.
    pub seed: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9000".into(),
            num_clients: 3,
            max_rounds: 5,
            start_delay_secs: 1.0,
            round_interval_secs: 5.0,
            clients: Vec::new(),
            client_port_base: 9100,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub id: ClientId,
    /// Local endpoint, `0.0.0.0:{client_port_base + id}` when absent.
    pub bind: Option<String>,
    pub coordinator: String,
    pub training_delay_secs: f64,
    pub training_stagger_secs: f64,
    /// Seed of the local model, random when absent.
    pub seed: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: 0,
            bind: None,
            coordinator: "127.0.0.1:9000".into(),
            training_delay_secs: 0.1,
            training_stagger_secs: 0.05,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub latency_secs: f64,
    pub loss_probability: f64,
    pub silent_clients: Vec<ClientId>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            latency_secs: 0.01,
            loss_probability: 0.0,
            silent_clients: Vec::new(),
        }
    }
}

impl Config {
    /// Reads and validates the configuration at `path`.
    ///
    /// # Errors
    /// `Config` if the file cannot be read, is not valid JSON or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| FedAvgError::Config(format!("cannot read {}: {e}", path.display())))?;

        let config: Self = serde_json::from_str(&text)
            .map_err(|e| FedAvgError::Config(format!("cannot parse {}: {e}", path.display())))?;

        config.validate()?;
        info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `path` if given, else the file named by `FEDAVG_CONFIG`, else
    /// the defaults.
    pub fn from_path_or_env(path: Option<&str>) -> Result<Self> {
        match path.map(str::to_owned).or_else(|| env::var(CONFIG_ENV).ok()) {
            Some(path) => Self::load(path),
            None => {
                info!("no configuration given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Checks the values serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.num_clients == 0 {
            return Err(FedAvgError::Config("num_clients must be at least 1".into()));
        }
        if self.coordinator.max_rounds == 0 {
            return Err(FedAvgError::Config("max_rounds must be at least 1".into()));
        }
        if self.model.input_dimension == 0 {
            return Err(FedAvgError::Config("input_dimension must be at least 1".into()));
        }
        if !(self.model.learning_rate.is_finite() && self.model.learning_rate > 0.0) {
            return Err(FedAvgError::Config(format!(
                "learning_rate must be positive, got {}",
                self.model.learning_rate
            )));
        }

        for (name, secs) in [
            ("start_delay_secs", self.coordinator.start_delay_secs),
            ("round_interval_secs", self.coordinator.round_interval_secs),
            ("training_delay_secs", self.client.training_delay_secs),
            ("training_stagger_secs", self.client.training_stagger_secs),
            ("latency_secs", self.simulation.latency_secs),
        ] {
            seconds(name, secs)?;
        }

        let p = self.simulation.loss_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(FedAvgError::Config(format!(
                "loss_probability must be within [0, 1], got {p}"
            )));
        }

        let clients = &self.coordinator.clients;
        if !clients.is_empty() && clients.len() != self.coordinator.num_clients {
            return Err(FedAvgError::Config(format!(
                "{} client endpoints configured for {} clients",
                clients.len(),
                self.coordinator.num_clients
            )));
        }

        self.data.validate()
    }

    pub fn round_timing(&self) -> Result<RoundTiming> {
        Ok(RoundTiming {
            start_delay: seconds("start_delay_secs", self.coordinator.start_delay_secs)?,
            round_interval: seconds("round_interval_secs", self.coordinator.round_interval_secs)?,
        })
    }

    pub fn training_schedule(&self) -> Result<TrainingSchedule> {
        Ok(TrainingSchedule {
            base: seconds("training_delay_secs", self.client.training_delay_secs)?,
            stagger: seconds("training_stagger_secs", self.client.training_stagger_secs)?,
        })
    }

    /// Endpoint of every client, indexed by client id.
    pub fn client_endpoints(&self) -> Vec<String> {
        if !self.coordinator.clients.is_empty() {
            return self.coordinator.clients.clone();
        }

        (0..self.coordinator.num_clients)
            .map(|i| format!("127.0.0.1:{}", self.client_port(i as ClientId)))
            .collect()
    }

    /// The address the configured client binds to.
    pub fn client_bind(&self) -> String {
        self.client
            .bind
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.client_port(self.client.id)))
    }

    fn client_port(&self, id: ClientId) -> u32 {
        u32::from(self.coordinator.client_port_base) + id
    }
}

fn seconds(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| FedAvgError::Config(format!("{name} must be a non-negative duration, got {secs}")))
}
