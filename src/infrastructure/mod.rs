//! Infrastructure Layer
//!
//! Connection management and shutdown coordination.

pub mod connection_pool;
pub mod shutdown;

pub use connection_pool::{
    Checkout, ConnectionPool, Direction, PeerConnection, PoolConfig, PoolError,
};
pub use shutdown::{shutdown_signal, ConnectionGuard, ShutdownController};
