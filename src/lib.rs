//! Federated averaging between one coordinator and a fixed set of clients.
//!
//! Each round the coordinator broadcasts its global model, every client trains
//! it on private data and reports its weights along with its sample count, and
//! the coordinator replaces the global model with the sample-weighted average.
//!
//! The protocol core ([`coordinator::Coordinator`], [`client::ClientAgent`])
//! does no IO. It runs either on actix actors over UDP ([`runtime`]) or inside
//! a deterministic discrete-event [`simulation`].

pub mod aggregation;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod message;
pub mod model;
pub mod observer;
pub mod runtime;
pub mod scheduler;
pub mod simulation;

pub use client::{ClientAgent, TrainingSchedule};
pub use config::Config;
pub use coordinator::{Advance, Coordinator, Receipt, RoundState, RoundTiming};
pub use error::{FedAvgError, Result};
pub use message::{ClientId, GlobalUpdate, LocalUpdate, Message};
pub use model::{Hyperparams, LinearModel};
pub use observer::{ChannelObserver, Event, LogObserver, NoopObserver, Observer};
pub use simulation::{NetworkModel, Simulation, SimulationReport};
