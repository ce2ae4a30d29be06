//! The dialer capability: bring up a local tunnel backed by a remote proxy.
//!
//! The validation core only talks to [`Dialer`] and [`TunnelHandle`]. Anything that can
//! expose a local SOCKS endpoint for a descriptor can sit behind them: the external
//! engine wrapper in [`engine`], an embedded protocol stack, or the [`mock`] used in tests.

pub mod engine;
pub mod mock;
mod ports;

pub use engine::{EngineConfig, EngineDialer};
pub use mock::{MockBehavior, MockDialer, MockStats};
pub use ports::{PortLease, PortPool};

use crate::error::DialError;
use crate::link::ConnectionDescriptor;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

/// An established tunnel, exclusively owned by one validation task.
#[async_trait]
pub trait TunnelHandle: Send {
    /// Local address speaking SOCKS5, forwarding through the remote proxy.
    fn local_addr(&self) -> SocketAddr;

    /// Whether the tunnel is still usable.
    async fn ready(&mut self) -> bool;

    /// Release every resource behind the tunnel. Safe to call more than once.
    async fn close(&mut self);
}

/// Establishes tunnels for connection descriptors.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Bring up a tunnel for `descriptor` within `budget`.
    ///
    /// On any error, including [`DialError::Timeout`], nothing the call acquired may
    /// outlive it. Dropping the returned future early must release resources too.
    async fn dial(
        &self,
        descriptor: &ConnectionDescriptor,
        budget: Duration,
    ) -> Result<Box<dyn TunnelHandle>, DialError>;
}
