//! Connection Acceptor
//!
//! Accepts inbound peer connections, registers them in the pool and spawns
//! their read loops. Resource exhaustion (fd limits, buffer space) backs off
//! and retries; anything else stops the acceptor.

use crate::replication::connection;
use crate::replication::node::NodeContext;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// First retry delay after a transient accept error.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound for the accept retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[cfg(target_os = "linux")]
const RESOURCE_ERRNOS: &[i32] = &[12, 23, 24, 105]; // ENOMEM ENFILE EMFILE ENOBUFS

#[cfg(windows)]
const RESOURCE_ERRNOS: &[i32] = &[10024, 10055]; // WSAEMFILE WSAENOBUFS

#[cfg(not(any(target_os = "linux", windows)))]
const RESOURCE_ERRNOS: &[i32] = &[12, 23, 24, 55];

/// Doubling delay between accept retries.
#[derive(Debug, Default)]
pub struct Backoff {
    current: Option<Duration>,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => INITIAL_BACKOFF,
            Some(delay) => (delay * 2).min(MAX_BACKOFF),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Whether an accept error is worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }
    err.raw_os_error()
        .map(|code| RESOURCE_ERRNOS.contains(&code))
        .unwrap_or(false)
}

/// Accept until shutdown or a persistent error.
#[cfg_attr(coverage_nightly, coverage(off))]
pub(crate) async fn run_acceptor(
    listener: TcpListener,
    ctx: Arc<NodeContext>,
) -> anyhow::Result<()> {
    let mut backoff = Backoff::default();

    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                backoff.reset();
                let (conn, reader) = ctx.pool.register(stream, addr);
                tracing::debug!("[{}] accepted connection from {}", ctx.config.name, addr);
                tokio::spawn(connection::serve_connection(ctx.clone(), conn, reader));
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "[{}] accept error: {}; retrying in {:?}",
                    ctx.config.name,
                    e,
                    delay
                );
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                tracing::error!("[{}] acceptor stopped: {}", ctx.config.name, e);
                return Err(anyhow::Error::new(e).context("accept failed"));
            }
        }
    }

    tracing::info!("[{}] acceptor stopped", ctx.config.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));

        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), MAX_BACKOFF);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_BACKOFF);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_fd_exhaustion_is_transient() {
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
        assert!(is_transient(&io::Error::from_raw_os_error(23)));
    }

    #[test]
    fn test_persistent_errors() {
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }
}
