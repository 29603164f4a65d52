use std::net::SocketAddr;

use actix::prelude::*;
use log::{debug, info, warn};

use super::{
    communication::{Datagram, UdpEndpoint, UdpTransport},
    coordinator::Shutdown,
};
use crate::{client::ClientAgent, message};

/* -------------------------------------------------------------------------- */
/*                               Actix messages                               */
/* -------------------------------------------------------------------------- */

#[derive(Message)]
#[rtype(result = "()")]
struct TrainNow; // training timer self-message

/* -------------------------------------------------------------------------- */
/*                                Client actor                                */
/* -------------------------------------------------------------------------- */

/// Runs a client agent on a UDP endpoint.
pub struct ClientActor {
    agent: ClientAgent,
    coordinator: Option<SocketAddr>,
    endpoint: UdpEndpoint,
    transport: UdpTransport,
    training_timer: Option<SpawnHandle>,
}

impl ClientActor {
    /// # Arguments
    /// * `agent` - The client's round agent.
    /// * `coordinator` - The resolved coordinator address, `None` if it could
    ///   not be resolved. The client then trains but never reports.
    /// * `endpoint` - The client's bound endpoint.
    pub fn new(agent: ClientAgent, coordinator: Option<SocketAddr>, endpoint: UdpEndpoint) -> Self {
        let transport = endpoint.transport();
        Self {
            agent,
            coordinator,
            endpoint,
            transport,
            training_timer: None,
        }
    }
}

impl Actor for ClientActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            "client {} listening on {}",
            self.agent.id(),
            self.endpoint.local_addr()
        );
        self.endpoint.listen(ctx.address().recipient());
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.endpoint.shutdown();
        debug!("client {} stopped", self.agent.id());
    }
}

impl Handler<Datagram> for ClientActor {
    type Result = ();

    fn handle(&mut self, msg: Datagram, ctx: &mut Self::Context) {
        let update = match message::Message::decode(&msg.payload) {
            Ok(message::Message::GlobalUpdate(update)) => update,
            Ok(other) => {
                warn!("client {} ignoring {} from {}", self.agent.id(), other.kind(), msg.from);
                return;
            }
            Err(e) => {
                warn!("client {} dropping datagram from {}: {e}", self.agent.id(), msg.from);
                return;
            }
        };

        if let Some(delay) = self.agent.on_global_update(&update) {
            self.training_timer = Some(ctx.notify_later(TrainNow, delay));
        }
    }
}

impl Handler<TrainNow> for ClientActor {
    type Result = ();

    fn handle(&mut self, _msg: TrainNow, _ctx: &mut Self::Context) {
        self.training_timer = None;

        let Some(update) = self.agent.train_and_report() else {
            return;
        };

        let Some(coordinator) = self.coordinator else {
            warn!(
                "client {} has no coordinator address, round {} report dropped",
                self.agent.id(),
                update.round_id
            );
            return;
        };

        let transport = self.transport.clone();
        let id = self.agent.id();
        actix_rt::spawn(async move {
            if let Err(e) = transport.send_message(coordinator, &update.into()).await {
                warn!("client {id} failed to report: {e}");
            }
        });
    }
}

impl Handler<Shutdown> for ClientActor {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        if let Some(timer) = self.training_timer.take() {
            ctx.cancel_future(timer);
        }
        info!("client {} shutting down", self.agent.id());
        ctx.stop();
    }
}
