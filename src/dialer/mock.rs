//! In-process dialer for tests and dry runs.
//!
//! Behaviour is chosen per host. Every dial, close and concurrently open tunnel is
//! counted in [`MockStats`], so callers can assert on resource discipline.

use super::{Dialer, TunnelHandle};
use crate::error::DialError;
use crate::link::ConnectionDescriptor;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// What the mock does when asked to dial a host.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Tunnel comes up after `delay`.
    Ready { delay: Duration },
    /// Dial fails with the given error after `delay`.
    Fail { error: DialError, delay: Duration },
    /// Dial never completes.
    Hang,
    /// Dial waits for a permit on the gate, then comes up. The permit is consumed.
    Gated(Arc<Semaphore>),
}

impl MockBehavior {
    pub fn ready() -> Self {
        MockBehavior::Ready { delay: Duration::ZERO }
    }

    pub fn fail(error: DialError) -> Self {
        MockBehavior::Fail { error, delay: Duration::ZERO }
    }
}

/// Counters shared between a [`MockDialer`] and the tunnels it hands out.
#[derive(Debug, Default)]
pub struct MockStats {
    dials: AtomicUsize,
    opened: AtomicUsize,
    closes: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    closes_per_tunnel: Mutex<HashMap<usize, usize>>,
}

impl MockStats {
    /// Calls to `dial`, whatever their outcome.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Tunnels successfully handed out.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Total `close()` calls, including repeated ones.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Dials in progress plus tunnels not yet closed.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest value `active` ever reached.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    /// `close()` calls per opened tunnel, indexed by open order.
    pub fn closes_per_tunnel(&self) -> Vec<usize> {
        let map = self.closes_per_tunnel.lock();
        (0..self.opened()).map(|id| map.get(&id).copied().unwrap_or(0)).collect()
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements `active` unless the dial turned into a tunnel.
struct DialGuard<'a> {
    stats: &'a MockStats,
    armed: bool,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.stats.leave();
        }
    }
}

/// Dialer whose outcome is scripted per host.
#[derive(Debug)]
pub struct MockDialer {
    default: MockBehavior,
    by_host: HashMap<String, MockBehavior>,
    stats: Arc<MockStats>,
}

impl MockDialer {
    pub fn new(default: MockBehavior) -> Self {
        Self {
            default,
            by_host: HashMap::new(),
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Override the behaviour for one host.
    pub fn with_host(mut self, host: impl Into<String>, behavior: MockBehavior) -> Self {
        self.by_host.insert(host.into(), behavior);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        descriptor: &ConnectionDescriptor,
        _budget: Duration,
    ) -> Result<Box<dyn TunnelHandle>, DialError> {
        self.stats.dials.fetch_add(1, Ordering::SeqCst);
        self.stats.enter();
        let mut guard = DialGuard { stats: &self.stats, armed: true };

        let behavior = self.by_host.get(descriptor.host()).unwrap_or(&self.default);
        match behavior {
            MockBehavior::Ready { delay } => tokio::time::sleep(*delay).await,
            MockBehavior::Fail { error, delay } => {
                tokio::time::sleep(*delay).await;
                return Err(error.clone());
            }
            MockBehavior::Hang => std::future::pending::<()>().await,
            MockBehavior::Gated(gate) => match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(DialError::ResourceUnavailable("gate closed".into())),
            },
        }

        guard.armed = false;
        let id = self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTunnel {
            id,
            local_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 1080)),
            open: true,
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Tunnel produced by [`MockDialer`].
#[derive(Debug)]
pub struct MockTunnel {
    id: usize,
    local_addr: SocketAddr,
    open: bool,
    stats: Arc<MockStats>,
}

#[async_trait]
impl TunnelHandle for MockTunnel {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn ready(&mut self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        *self.stats.closes_per_tunnel.lock().entry(self.id).or_insert(0) += 1;
        if self.open {
            self.open = false;
            self.stats.leave();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;

    #[tokio::test]
    async fn scripted_per_host() {
        let dialer = MockDialer::new(MockBehavior::ready())
            .with_host("bad.host", MockBehavior::fail(DialError::Refused("nope".into())));
        let good = link::parse("trojan://pw@good.host:443").unwrap();
        let bad = link::parse("trojan://pw@bad.host:443").unwrap();

        let mut tunnel = dialer.dial(&good, Duration::from_secs(1)).await.unwrap();
        assert!(tunnel.ready().await);
        assert!(dialer.dial(&bad, Duration::from_secs(1)).await.is_err());

        let stats = dialer.stats();
        assert_eq!(stats.dials(), 2);
        assert_eq!(stats.active(), 1);

        tunnel.close().await;
        tunnel.close().await;
        assert!(!tunnel.ready().await);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.closes_per_tunnel(), vec![2]);
    }

    #[tokio::test]
    async fn dropped_dial_leaves_no_active_count() {
        let dialer = MockDialer::new(MockBehavior::Hang);
        let desc = link::parse("trojan://pw@slow.host:443").unwrap();
        let dial = dialer.dial(&desc, Duration::from_secs(1));
        let result = tokio::time::timeout(Duration::from_millis(20), dial).await;
        assert!(result.is_err());
        assert_eq!(dialer.stats().active(), 0);
        assert_eq!(dialer.stats().peak_active(), 1);
    }
}
