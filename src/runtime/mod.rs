//! Actix actors running the protocol over UDP.

pub mod client;
pub mod communication;
pub mod coordinator;

use std::sync::Arc;

use actix::prelude::*;
use log::warn;

pub use client::ClientActor;
pub use communication::{resolve, resolve_all, Datagram, UdpEndpoint, UdpTransport};
pub use coordinator::{CoordinatorActor, CoordinatorSnapshot, Shutdown, Snapshot};

use crate::{
    client::ClientAgent, config::Config, coordinator::Coordinator, error::Result,
    model::LinearModel, observer::Observer,
};

/// Binds the coordinator endpoint, resolves the clients and starts the
/// coordinator actor on the current arbiter.
///
/// # Errors
/// `Config` if the configuration is invalid, `Io` if the endpoint cannot be
/// bound. Unresolvable clients are only logged.
pub async fn spawn_coordinator(
    config: &Config,
    observer: Arc<dyn Observer>,
) -> Result<Addr<CoordinatorActor>> {
    config.validate()?;

    let endpoint = UdpEndpoint::bind(&config.coordinator.bind).await?;
    let clients = resolve_all(&config.client_endpoints()).await;

    let model = match config.coordinator.seed {
        Some(seed) => LinearModel::new(config.model, seed),
        None => LinearModel::from_entropy(config.model),
    };
    let coordinator = Coordinator::new(
        config.coordinator.num_clients,
        config.coordinator.max_rounds,
        model,
        observer,
    );

    Ok(CoordinatorActor::new(coordinator, config.round_timing()?, clients, endpoint).start())
}

/// Binds the endpoint of `config.client.id`, generates its data and starts
/// the client actor on the current arbiter.
///
/// # Errors
/// `Config` if the configuration is invalid, `Io` if the endpoint cannot be
/// bound. An unresolvable coordinator is only logged.
pub async fn spawn_client(config: &Config, observer: Arc<dyn Observer>) -> Result<Addr<ClientActor>> {
    config.validate()?;

    let id = config.client.id;
    let endpoint = UdpEndpoint::bind(&config.client_bind()).await?;
    let coordinator = resolve(&config.client.coordinator)
        .await
        .inspect_err(|e| warn!("{e}, client {id} will never report"))
        .ok();

    let data = config.data.generate(id, config.model.input_dimension)?;
    let model = match config.client.seed {
        Some(seed) => LinearModel::new(config.model, seed),
        None => LinearModel::from_entropy(config.model),
    };
    let agent = ClientAgent::new(id, model, data, config.training_schedule()?, observer);

    Ok(ClientActor::new(agent, coordinator, endpoint).start())
}
