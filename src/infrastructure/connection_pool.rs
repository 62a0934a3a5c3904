//! Connection Pool
//!
//! Long-lived peer connections keyed by the remote socket address observed
//! on the stream. Outbound connections are dialed lazily; inbound ones are
//! registered by the acceptor. Any I/O failure removes the connection so the
//! next round re-dials.

use crate::replication::transport::{write_frame, FrameError, WireFormat};
use crate::replication::{Message, RoundPhase};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Payload format written on every connection
    pub format: WireFormat,
    /// Dial timeout
    pub connect_timeout: Duration,
    /// Deadline for writing one frame
    pub write_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::Binary,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A pooled peer connection.
///
/// The write half sits behind its own async mutex so each connection has at
/// most one outbound frame in flight. The read half is owned by the
/// connection's read loop.
pub struct PeerConnection {
    id: u64,
    addr: SocketAddr,
    direction: Direction,
    format: WireFormat,
    write_timeout: Duration,
    writer: Mutex<OwnedWriteHalf>,
    phase: parking_lot::Mutex<RoundPhase>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .finish()
    }
}

impl PeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Write one message as a frame.
    pub async fn send(&self, msg: &Message) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, msg, self.format, self.write_timeout).await
    }

    pub fn phase(&self) -> RoundPhase {
        *self.phase.lock()
    }

    /// Try to claim the connection for a new initiator round.
    pub fn begin_round(&self, awaits_reply: bool, stale_after: Duration) -> bool {
        let mut phase = self.phase.lock();
        let now = Instant::now();
        if !phase.can_begin(now, stale_after) {
            return false;
        }
        *phase = if awaits_reply {
            RoundPhase::AwaitingExchange { since: now }
        } else {
            RoundPhase::Idle
        };
        true
    }

    /// Record that the reply arrived. Returns whether it was solicited.
    pub fn reply_received(&self) -> bool {
        let mut phase = self.phase.lock();
        let solicited = matches!(*phase, RoundPhase::AwaitingExchange { .. });
        *phase = RoundPhase::SendingEnd;
        solicited
    }

    pub fn finish_round(&self) {
        *self.phase.lock() = RoundPhase::Idle;
    }

    pub fn round_in_flight(&self) -> bool {
        self.phase.lock().in_flight()
    }
}

/// Result of [`ConnectionPool::get_or_connect`].
pub enum Checkout {
    /// Connection already in the pool
    Pooled(Arc<PeerConnection>),
    /// Freshly dialed; the caller owns the read half and must drive it
    Dialed(Arc<PeerConnection>, OwnedReadHalf),
}

impl Checkout {
    pub fn connection(&self) -> &Arc<PeerConnection> {
        match self {
            Checkout::Pooled(conn) | Checkout::Dialed(conn, _) => conn,
        }
    }
}

/// Connection pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("connection failed: {0}")]
    ConnectError(#[from] std::io::Error),
    #[error("connection timeout")]
    ConnectTimeout,
}

/// Connection pool manager.
pub struct ConnectionPool {
    config: PoolConfig,
    connections: DashMap<SocketAddr, Arc<PeerConnection>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create a new connection pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Get a pooled connection by remote address.
    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<PeerConnection>> {
        self.connections.get(addr).map(|c| c.value().clone())
    }

    /// Split a stream into a pooled connection handle and its read half.
    fn wrap(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        direction: Direction,
    ) -> (Arc<PeerConnection>, OwnedReadHalf) {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let conn = Arc::new(PeerConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            addr,
            direction,
            format: self.config.format,
            write_timeout: self.config.write_timeout,
            writer: Mutex::new(writer),
            phase: parking_lot::Mutex::new(RoundPhase::Idle),
        });
        (conn, reader)
    }

    /// Register an accepted stream. Replaces any connection under the same address.
    pub fn register(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> (Arc<PeerConnection>, OwnedReadHalf) {
        let (conn, reader) = self.wrap(stream, addr, Direction::Inbound);
        self.connections.insert(addr, conn.clone());
        (conn, reader)
    }

    /// Return the pooled connection for `address`, dialing if there is none.
    ///
    /// The map is only locked for the lookup and the insert, never across the
    /// dial. Two concurrent dials to the same address may race; the loser's
    /// stream is discarded and the winner is returned.
    pub async fn get_or_connect(&self, address: &str) -> Result<Checkout, PoolError> {
        let addr = tokio::net::lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| PoolError::Resolve(address.to_string()))?;

        if let Some(conn) = self.get(&addr) {
            return Ok(Checkout::Pooled(conn));
        }

        let dial = TcpStream::connect(addr);
        let stream = match tokio::time::timeout(self.config.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(PoolError::ConnectError(e)),
            Err(_) => return Err(PoolError::ConnectTimeout),
        };
        let remote = stream.peer_addr().unwrap_or(addr);

        match self.connections.entry(remote) {
            MapEntry::Occupied(existing) => {
                tracing::debug!("discarding duplicate dial to {}", remote);
                Ok(Checkout::Pooled(existing.get().clone()))
            }
            MapEntry::Vacant(slot) => {
                let (conn, reader) = self.wrap(stream, remote, Direction::Outbound);
                slot.insert(conn.clone());
                tracing::debug!("dialed peer {} (conn {})", remote, conn.id);
                Ok(Checkout::Dialed(conn, reader))
            }
        }
    }

    /// Remove a connection. Idempotent, and a no-op if the address now maps
    /// to a different connection.
    pub fn remove(&self, conn: &PeerConnection) -> bool {
        self.connections
            .remove_if(&conn.addr, |_, pooled| pooled.id == conn.id)
            .is_some()
    }
}
