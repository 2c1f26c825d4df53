//! Connection state machine and the server event loop.
//!
//! The server drives exactly one client through its lifecycle:
//!
//! ```text
//! ConnectRequest ──► resources allocated, receive pre-posted, accepted
//! Established   ──► liveness echo, probe, descriptor reply
//! Disconnected  ──► teardown, server returns
//! ```
//!
//! A second connect request while a client is live is rejected. Teardown
//! is best-effort: every resource gets its destroy attempted even when an
//! earlier one fails.

use std::net::SocketAddr;
use std::sync::Arc;

use remora_fabric::{CmEvent, CmId, ConnId, Listener};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::poller;
use crate::protocol::{ExchangeMessage, PendingRecv, ProtocolEngine};
use crate::region::MemoryRegion;
use crate::resources::ConnectionResources;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Resources allocated, accept sent, waiting for the peer.
    ResourcesReady,
    /// Handshake complete; the peer works the region directly.
    Established,
    /// Torn down.
    Closed,
}

/// One live client connection.
pub struct Connection {
    res: ConnectionResources,
    engine: ProtocolEngine,
    state: ConnState,
    pending_recv: Option<PendingRecv>,
    region: Option<MemoryRegion>,
}

impl Connection {
    /// Resolve a connect request: allocate resources, pre-post the first
    /// receive so the peer's opening message cannot be lost, and accept.
    pub fn open(id: Arc<CmId>, config: &ServerConfig) -> Result<Self, ServerError> {
        let res = ConnectionResources::allocate(id, config)?;
        let mut engine = ProtocolEngine::new();
        let pending_recv = engine.post_recv(&res)?;
        res.id.accept(config.conn_param)?;

        Ok(Self {
            res,
            engine,
            state: ConnState::ResourcesReady,
            pending_recv: Some(pending_recv),
            region: None,
        })
    }

    pub fn conn_id(&self) -> ConnId {
        self.res.id.conn_id()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The region, once the handshake has built it.
    pub fn region(&self) -> Option<&MemoryRegion> {
        self.region.as_ref()
    }

    /// Run the exchange: liveness echo, then descriptor reply to the
    /// probe. Every completion wait is bounded by the handshake timeout.
    pub async fn run_handshake(&mut self, config: &ServerConfig) -> Result<(), ServerError> {
        if self.state != ConnState::ResourcesReady {
            return Err(ServerError::EventOutOfOrder(
                "established before resources were ready",
            ));
        }
        let timeout = config.handshake_timeout;

        // Opening liveness from the peer.
        poller::wait_for_completions(&self.res, 1, timeout).await?;
        let recv = self.take_recv()?;
        let offset = match recv.decode()? {
            ExchangeMessage::Liveness { offset } => offset,
            ExchangeMessage::Descriptor(_) => {
                return Err(ServerError::UnexpectedMessage(
                    "descriptor before liveness exchange",
                ));
            }
        };
        tracing::info!(conn = %self.conn_id(), offset, "liveness received");

        // Echo with the incremented counter.
        self.engine
            .post_liveness(&self.res, offset.wrapping_add(1))?;
        poller::wait_for_completions(&self.res, 1, timeout).await?;

        // Probe for the region descriptor.
        self.pending_recv = Some(self.engine.post_recv(&self.res)?);
        poller::wait_for_completions(&self.res, 1, timeout).await?;
        let probe = self.take_recv()?;
        match probe.decode()? {
            ExchangeMessage::Liveness { .. } => {}
            ExchangeMessage::Descriptor(_) => {
                return Err(ServerError::UnexpectedMessage(
                    "descriptor where a probe was expected",
                ));
            }
        }

        // Build and advertise the region. The region exists and is
        // initialized before the descriptor ever leaves this side.
        let region = MemoryRegion::build(&self.res.pd, config.data_size, config.block_size)?;
        let desc = region.descriptor();
        self.region = Some(region);

        self.engine.post_descriptor(&self.res, desc)?;
        poller::wait_for_completions(&self.res, 1, timeout).await?;

        self.state = ConnState::Established;
        tracing::info!(
            conn = %self.conn_id(),
            addr = desc.addr,
            len = desc.len,
            "handshake complete, region advertised"
        );
        Ok(())
    }

    fn take_recv(&mut self) -> Result<PendingRecv, ServerError> {
        self.pending_recv
            .take()
            .ok_or(ServerError::EventOutOfOrder("no receive pending"))
    }

    /// Best-effort teardown in reverse allocation order. Each destroy is
    /// attempted regardless of earlier failures.
    pub fn teardown(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        let conn = self.conn_id();

        if let Err(err) = self.res.qp.destroy() {
            tracing::warn!(%conn, error = %err, "queue pair teardown failed");
        }
        if let Err(err) = self.res.cq.destroy() {
            tracing::warn!(%conn, error = %err, "completion queue teardown failed");
        }
        if let Err(err) = self.res.channel.destroy() {
            tracing::warn!(%conn, error = %err, "completion channel teardown failed");
        }
        if let Err(err) = self.res.id.destroy() {
            tracing::warn!(%conn, error = %err, "connection id teardown failed");
        }

        self.region = None;
        self.pending_recv = None;
        self.state = ConnState::Closed;
        tracing::info!(%conn, "connection torn down");
    }
}

/// The server: a listener plus at most one live connection.
pub struct Server {
    config: ServerConfig,
    listener: Listener,
}

impl Server {
    /// Bind the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = Listener::bind(config.listen_addr()).await?;
        Ok(Self { config, listener })
    }

    /// The bound address (with the resolved port).
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Serve one client to completion: rendezvous, handshake, then wait
    /// for its disconnect. Returns once the client has gone, or with the
    /// first fatal error.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut connection: Option<Connection> = None;

        loop {
            let event = self
                .listener
                .next_event()
                .await
                .ok_or(ServerError::ListenerClosed)?;

            match event {
                CmEvent::ConnectRequest(id) => {
                    if connection.is_some() {
                        tracing::warn!(
                            conn = %id.conn_id(),
                            peer = %id.peer_addr(),
                            "rejecting connect request while a client is live"
                        );
                        if let Err(err) = id.destroy() {
                            tracing::warn!(error = %err, "failed to destroy rejected id");
                        }
                        continue;
                    }
                    tracing::info!(conn = %id.conn_id(), peer = %id.peer_addr(), "connect request");
                    match Connection::open(id, &self.config) {
                        Ok(conn) => connection = Some(conn),
                        Err(err) => return Err(err),
                    }
                }
                CmEvent::Established(conn) => {
                    let Some(connection) = connection.as_mut() else {
                        return Err(ServerError::EventOutOfOrder(
                            "established with no pending connection",
                        ));
                    };
                    if connection.conn_id() != conn {
                        return Err(ServerError::EventOutOfOrder(
                            "established for an unknown connection",
                        ));
                    }
                    if let Err(err) = connection.run_handshake(&self.config).await {
                        connection.teardown();
                        return Err(err);
                    }
                }
                CmEvent::Disconnected(conn) => {
                    tracing::info!(%conn, "client disconnected");
                    if let Some(mut connection) = connection.take() {
                        connection.teardown();
                    }
                    return Ok(());
                }
                CmEvent::Unknown { conn, kind } => {
                    tracing::error!(%conn, kind, "unknown event kind");
                    if let Some(mut connection) = connection.take() {
                        connection.teardown();
                    }
                    return Err(ServerError::UnknownEvent { conn, kind });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_fabric::RemoteClient;

    #[tokio::test]
    async fn descriptor_as_opening_message_is_rejected() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            port: 0,
            handshake_timeout: std::time::Duration::from_secs(2),
            ..ServerConfig::default()
        };
        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr();
        let server_task = tokio::spawn(server.run());

        let mut client = RemoteClient::connect(addr).await.unwrap();
        client.wait_established().await.unwrap();

        let bogus = ExchangeMessage::Descriptor(remora_fabric::RegionDescriptor {
            addr: 0,
            len: 0,
            rkey: 0,
            lkey: 0,
        });
        client.send_message(&bogus.encode()).await.unwrap();

        match server_task.await.unwrap() {
            Err(ServerError::UnexpectedMessage(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_total() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..ServerConfig::default()
        };
        let mut listener = Listener::bind(config.listen_addr()).await.unwrap();
        let addr = listener.local_addr();
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();

        let id = match listener.next_event().await.unwrap() {
            CmEvent::ConnectRequest(id) => id,
            other => panic!("unexpected event: {:?}", other),
        };
        let mut conn = Connection::open(id, &config).unwrap();

        // Pre-destroy one resource; teardown must still reach the rest.
        conn.res.qp.destroy().unwrap();
        conn.teardown();
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(conn.res.cq.is_destroyed());
        assert!(conn.res.channel.is_destroyed());
        assert!(conn.res.id.is_destroyed());

        // A second teardown is a no-op.
        conn.teardown();
        assert_eq!(conn.state(), ConnState::Closed);
    }
}
