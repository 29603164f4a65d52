use std::net::SocketAddr;

use actix::prelude::*;
use log::{debug, info, warn};

use super::communication::{Datagram, UdpEndpoint, UdpTransport};
use crate::{
    coordinator::{Advance, Coordinator, Receipt, RoundState, RoundTiming},
    message,
};

/* -------------------------------------------------------------------------- */
/*                               Actix messages                               */
/* -------------------------------------------------------------------------- */

#[derive(Message)]
#[rtype(result = "()")]
struct AdvanceRound; // round timer self-message

/// Stops an actor without firing its outstanding timers.
#[derive(Message, Debug, Clone, Copy)]
#[rtype(result = "()")]
pub struct Shutdown;

/// Asks the coordinator for its current state.
#[derive(Message, Debug, Clone, Copy)]
#[rtype(result = "CoordinatorSnapshot")]
pub struct Snapshot;

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSnapshot {
    pub state: RoundState,
    pub global_weights: Vec<f64>,
    pub received: usize,
}

/* -------------------------------------------------------------------------- */
/*                              Coordinator actor                             */
/* -------------------------------------------------------------------------- */

/// Runs the round state machine on a UDP endpoint.
pub struct CoordinatorActor {
    coordinator: Coordinator,
    timing: RoundTiming,
    clients: Vec<Option<SocketAddr>>,
    endpoint: UdpEndpoint,
    transport: UdpTransport,
    round_timer: Option<SpawnHandle>,
}

impl CoordinatorActor {
    /// # Arguments
    /// * `coordinator` - An idle coordinator.
    /// * `timing` - Start delay and round interval.
    /// * `clients` - Resolved client addresses indexed by client id, `None`
    ///   for the ones that could not be resolved.
    /// * `endpoint` - The coordinator's bound endpoint.
    pub fn new(
        coordinator: Coordinator,
        timing: RoundTiming,
        clients: Vec<Option<SocketAddr>>,
        endpoint: UdpEndpoint,
    ) -> Self {
        let transport = endpoint.transport();
        Self {
            coordinator,
            timing,
            clients,
            endpoint,
            transport,
            round_timer: None,
        }
    }

    fn arm_round_timer(&mut self, ctx: &mut Context<Self>, after: std::time::Duration) {
        if let Some(previous) = self.round_timer.take() {
            ctx.cancel_future(previous);
        }
        self.round_timer = Some(ctx.notify_later(AdvanceRound, after));
    }

    fn broadcast(&self, msg: &message::Message) {
        let round = msg.round_id();
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("cannot encode round {round} broadcast: {e}");
                return;
            }
        };

        let transport = self.transport.clone();
        let clients = self.clients.clone();

        actix_rt::spawn(async move {
            for (id, addr) in clients.into_iter().enumerate() {
                let Some(addr) = addr else {
                    debug!("client {id} is unreachable, skipping");
                    continue;
                };

                match transport.send_to(addr, &payload).await {
                    Ok(()) => debug!("sent round {round} model to client {id}"),
                    Err(e) => warn!("failed to send round {round} to client {id}: {e}"),
                }
            }
        });
    }
}

impl Actor for CoordinatorActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            "coordinator listening on {}, waiting for {} clients",
            self.endpoint.local_addr(),
            self.coordinator.num_clients()
        );

        self.endpoint.listen(ctx.address().recipient());
        self.arm_round_timer(ctx, self.timing.start_delay);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.endpoint.shutdown();
        debug!("coordinator stopped");
    }
}

impl Handler<AdvanceRound> for CoordinatorActor {
    type Result = ();

    fn handle(&mut self, _msg: AdvanceRound, ctx: &mut Self::Context) {
        self.round_timer = None;

        match self.coordinator.advance() {
            Advance::Started(update) => {
                self.broadcast(&update.into());
                self.arm_round_timer(ctx, self.timing.round_interval);
            }
            Advance::Completed { rounds } => {
                debug!("no rounds left after {rounds}, round timer disarmed");
            }
        }
    }
}

impl Handler<Datagram> for CoordinatorActor {
    type Result = ();

    fn handle(&mut self, msg: Datagram, _ctx: &mut Self::Context) {
        let update = match message::Message::decode(&msg.payload) {
            Ok(message::Message::LocalUpdate(update)) => update,
            Ok(other) => {
                warn!("ignoring {} from {}", other.kind(), msg.from);
                return;
            }
            Err(e) => {
                warn!("dropping datagram from {}: {e}", msg.from);
                return;
            }
        };

        match self.coordinator.handle_local_update(update) {
            Ok(Receipt::Pending { received, expected }) => {
                debug!("received {received}/{expected} models")
            }
            Ok(_) => {}
            Err(e) => warn!("discarding update from {}: {e}", msg.from),
        }
    }
}

impl Handler<Snapshot> for CoordinatorActor {
    type Result = MessageResult<Snapshot>;

    fn handle(&mut self, _msg: Snapshot, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(CoordinatorSnapshot {
            state: self.coordinator.state(),
            global_weights: self.coordinator.global_model().weights().to_vec(),
            received: self.coordinator.record().len(),
        })
    }
}

impl Handler<Shutdown> for CoordinatorActor {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        if let Some(timer) = self.round_timer.take() {
            ctx.cancel_future(timer);
        }
        info!("coordinator shutting down");
        ctx.stop();
    }
}
