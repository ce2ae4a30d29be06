//! Local port leasing for tunnels.

use crate::error::DialError;

use log::debug;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::Arc;

const MAX_ATTEMPTS: usize = 64;

/// Hands out free local ports so that concurrent tunnels never collide.
#[derive(Debug)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    leased: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Arc<Self> {
        Arc::new(Self {
            range,
            leased: Mutex::new(HashSet::new()),
        })
    }

    /// Lease a random port from the range that is neither leased nor bound.
    pub fn lease(self: &Arc<Self>) -> Result<PortLease, DialError> {
        let (low, high) = (*self.range.start(), *self.range.end());
        if low == 0 || low > high {
            return Err(DialError::ResourceUnavailable(format!(
                "invalid port range {}-{}",
                low, high
            )));
        }

        let mut rng = rand::rng();
        for _ in 0..MAX_ATTEMPTS {
            let port = rng.random_range(low..=high);
            {
                let mut leased = self.leased.lock();
                if leased.contains(&port) {
                    continue;
                }
                if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err() {
                    continue;
                }
                leased.insert(port);
            }
            debug!("Leased local port {}", port);
            return Ok(PortLease {
                port,
                pool: Arc::clone(self),
            });
        }

        Err(DialError::ResourceUnavailable(format!(
            "no free local port in {}-{}",
            low, high
        )))
    }

    /// Number of ports currently leased.
    pub fn leased(&self) -> usize {
        self.leased.lock().len()
    }
}

/// A leased port, returned to the pool on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    pool: Arc<PortPool>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.leased.lock().remove(&self.port);
    }
}
