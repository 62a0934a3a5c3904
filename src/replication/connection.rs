//! Connection Driver
//!
//! The per-connection read loop shared by inbound and outbound connections,
//! and the initiator side of a reconciliation round.

use crate::infrastructure::connection_pool::{Checkout, PeerConnection};
use crate::replication::node::NodeContext;
use crate::replication::transport::{read_frame, FrameError};
use crate::replication::types::MessageKind;
use anyhow::Context;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;

/// What happened when a round was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Opening message written
    Started,
    /// Previous round on the same connection still awaiting its reply
    Busy,
    /// Node is stopping; no new rounds
    ShuttingDown,
}

/// Open one reconciliation round with the peer at `address`.
///
/// Dials through the pool when needed and spawns the read loop for a freshly
/// dialed connection. A failed write drops the connection from the pool.
pub(crate) async fn initiate_round(
    ctx: &Arc<NodeContext>,
    address: &str,
) -> anyhow::Result<RoundOutcome> {
    if ctx.shutdown.is_shutdown() {
        return Ok(RoundOutcome::ShuttingDown);
    }

    let conn = match ctx
        .pool
        .get_or_connect(address)
        .await
        .with_context(|| format!("failed to reach peer {}", address))?
    {
        Checkout::Pooled(conn) => conn,
        Checkout::Dialed(conn, reader) => {
            tokio::spawn(serve_connection(ctx.clone(), conn.clone(), reader));
            conn
        }
    };

    if !conn.begin_round(ctx.strategy.expects_reply(), ctx.config.io_timeout) {
        return Ok(RoundOutcome::Busy);
    }

    let opening = ctx.strategy.open_round(&ctx.cache);
    let records = opening.len();
    if let Err(e) = conn.send(&opening).await {
        conn.finish_round();
        ctx.pool.remove(&conn);
        return Err(anyhow::Error::new(e).context(format!("failed to open round with {}", address)));
    }

    tracing::debug!(
        "[{}] opened {} round with {} ({} records)",
        ctx.config.name,
        ctx.strategy.name(),
        conn.addr(),
        records
    );
    Ok(RoundOutcome::Started)
}

/// Read frames until the peer leaves, a frame is bad, or shutdown.
///
/// After shutdown the loop only keeps reading while this side has a round
/// awaiting its reply, and then no longer than `io_timeout`.
#[cfg_attr(coverage_nightly, coverage(off))]
pub(crate) async fn serve_connection(
    ctx: Arc<NodeContext>,
    conn: Arc<PeerConnection>,
    mut reader: OwnedReadHalf,
) {
    let _guard = ctx.shutdown.connection_guard();
    let format = ctx.strategy.wire_format();
    let name = ctx.config.name.as_str();

    tracing::debug!(
        "[{}] connection {} to {} open ({:?})",
        name,
        conn.id(),
        conn.addr(),
        conn.direction()
    );

    loop {
        if ctx.shutdown.is_shutdown() && !conn.round_in_flight() {
            break;
        }

        let read = read_frame(&mut reader, format, &ctx.limits);
        tokio::pin!(read);

        let interrupted = tokio::select! {
            frame = &mut read => Ok(frame),
            _ = ctx.shutdown.cancelled() => Err(()),
        };
        let frame = match interrupted {
            Ok(frame) => frame,
            Err(()) => {
                if !conn.round_in_flight() {
                    break;
                }
                match tokio::time::timeout(ctx.limits.io_timeout, &mut read).await {
                    Ok(frame) => frame,
                    Err(_) => break,
                }
            }
        };

        let message = match frame {
            Ok(message) => message,
            Err(FrameError::Closed) => {
                tracing::debug!("[{}] {} closed the connection", name, conn.addr());
                break;
            }
            Err(FrameError::Idle(after)) if !conn.round_in_flight() => {
                tracing::debug!("[{}] closing {} after {:?} idle", name, conn.addr(), after);
                break;
            }
            Err(e) if e.is_transport() => {
                tracing::warn!("[{}] connection to {} failed: {}", name, conn.addr(), e);
                break;
            }
            Err(e) => {
                tracing::warn!("[{}] dropping {} after bad frame: {}", name, conn.addr(), e);
                break;
            }
        };

        let kind = message.kind();
        let closes_round = kind == MessageKind::Exchange;
        if closes_round && !conn.reply_received() {
            tracing::debug!("[{}] unsolicited Exchange from {}", name, conn.addr());
        }

        let reply = match ctx.strategy.on_message(message, &ctx.cache) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("[{}] protocol violation from {}: {}", name, conn.addr(), e);
                break;
            }
        };

        if let Some(reply) = reply {
            let reply_kind = reply.kind();
            let records = reply.len();
            if let Err(e) = conn.send(&reply).await {
                tracing::warn!(
                    "[{}] failed to send {} to {}: {}",
                    name,
                    reply_kind,
                    conn.addr(),
                    e
                );
                break;
            }
            tracing::debug!(
                "[{}] answered {} from {} with {} ({} records)",
                name,
                kind,
                conn.addr(),
                reply_kind,
                records
            );
        }

        if closes_round {
            conn.finish_round();
        }
    }

    conn.finish_round();
    ctx.pool.remove(&conn);
    tracing::debug!("[{}] connection {} to {} closed", name, conn.id(), conn.addr());
}
