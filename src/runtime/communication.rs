use std::{net::SocketAddr, sync::Arc};

use actix::prelude::*;
use futures::future::join_all;
use log::{debug, warn};
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{FedAvgError, Result},
    message,
};

/// Largest payload a UDP datagram can carry over IPv4.
const MAX_DATAGRAM: usize = 65_507;

/// A datagram received on an endpoint, forwarded to its actor.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct Datagram {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
}

/// Best-effort sender over a shared UDP socket.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Sends `payload` to `target` once the socket is writable.
    pub async fn send_to(&self, target: SocketAddr, payload: &[u8]) -> Result<()> {
        let sent = self.socket.send_to(payload, target).await?;
        if sent != payload.len() {
            return Err(FedAvgError::Io(std::io::Error::other(format!(
                "sent {sent} of {} bytes to {target}",
                payload.len()
            ))));
        }

        Ok(())
    }

    /// Encodes `msg` and sends it to `target`.
    pub async fn send_message(&self, target: SocketAddr, msg: &message::Message) -> Result<()> {
        let payload = msg.encode()?;
        self.send_to(target, &payload).await?;
        debug!("sent {} for round {} to {target}", msg.kind(), msg.round_id());
        Ok(())
    }
}

/// A bound UDP socket plus the receive loop feeding an actor.
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    token: CancellationToken,
}

impl UdpEndpoint {
    /// Binds a new endpoint.
    ///
    /// # Errors
    /// `Io` if the address cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!("bound udp endpoint on {local_addr}");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            token: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport(&self) -> UdpTransport {
        UdpTransport {
            socket: Arc::clone(&self.socket),
        }
    }

    /// Spawns the receive loop on the current arbiter, forwarding every
    /// datagram to `recipient` until [`UdpEndpoint::shutdown`] is called or
    /// the recipient goes away.
    pub fn listen(&self, recipient: Recipient<Datagram>) {
        let socket = Arc::clone(&self.socket);
        let token = self.token.clone();
        let local = self.local_addr;

        actix_rt::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            if !recipient.connected() {
                                break;
                            }
                            debug!("{local} received {len} bytes from {from}");
                            recipient.do_send(Datagram {
                                from,
                                payload: buf[..len].to_vec(),
                            });
                        }
                        Err(e) => warn!("receive error on {local}: {e}"),
                    }
                }
            }

            debug!("receive loop on {local} stopped");
        });
    }

    /// Stops the receive loop.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

/// Resolves `endpoint` (`host:port`) to its first socket address.
///
/// # Errors
/// `UnresolvedEndpoint` if the lookup fails or yields nothing.
pub async fn resolve(endpoint: &str) -> Result<SocketAddr> {
    let mut addrs = lookup_host(endpoint)
        .await
        .map_err(|e| FedAvgError::UnresolvedEndpoint {
            endpoint: endpoint.to_owned(),
            source: Some(e),
        })?;

    addrs.next().ok_or_else(|| FedAvgError::UnresolvedEndpoint {
        endpoint: endpoint.to_owned(),
        source: None,
    })
}

/// Resolves every endpoint concurrently, keeping their order. Unresolvable
/// ones are logged and left as `None`.
pub async fn resolve_all(endpoints: &[String]) -> Vec<Option<SocketAddr>> {
    join_all(endpoints.iter().map(|endpoint| async move {
        resolve(endpoint)
            .await
            .inspect_err(|e| warn!("{e}, peer will not be reached"))
            .ok()
    }))
    .await
}
