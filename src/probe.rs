//! Latency probes run through an established tunnel.

use crate::config::ValidatorConfig;
use crate::error::ProbeError;

use async_trait::async_trait;
use log::debug;
use std::error::Error as _;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use url::Url;

/// Measures round-trip latency through a local SOCKS endpoint.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Perform one request through `proxy`, returning the latency in milliseconds.
    async fn probe(&self, proxy: SocketAddr, budget: Duration) -> Result<f64, ProbeError>;
}

/// Probe that fetches a fixed URL over the tunnel with reqwest.
///
/// Any HTTP response counts as reachable; the status code is only logged.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    target: Url,
}

impl HttpProbe {
    pub fn new(target: Url) -> Self {
        Self { target }
    }

    /// Probe the configured `probe_url`.
    pub fn from_config(config: &ValidatorConfig) -> Result<Self, url::ParseError> {
        Url::parse(&config.probe_url).map(Self::new)
    }

    pub fn target(&self) -> &Url {
        &self.target
    }
}

fn is_timeout(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return true;
    }
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = inner.source();
    }
    false
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, proxy: SocketAddr, budget: Duration) -> Result<f64, ProbeError> {
        // socks5h: let the remote side resolve the target name.
        let proxy = reqwest::Proxy::all(format!("socks5h://{}", proxy))
            .map_err(|e| ProbeError::Unreachable(format!("invalid proxy address: {}", e)))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(budget)
            .build()
            .map_err(|e| ProbeError::Unreachable(format!("cannot build client: {}", e)))?;

        let start = Instant::now();
        let request = client.get(self.target.clone()).send();
        let response = match tokio::time::timeout(budget, request).await {
            Err(_) => return Err(ProbeError::Timeout),
            Ok(Err(e)) if is_timeout(&e) => return Err(ProbeError::Timeout),
            Ok(Err(e)) => return Err(ProbeError::Unreachable(e.without_url().to_string())),
            Ok(Ok(response)) => response,
        };
        let latency = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "Probe {} via {} answered {} in {:.0}ms",
            self.target,
            proxy_label(&response),
            response.status(),
            latency
        );
        Ok(latency)
    }
}

fn proxy_label(response: &reqwest::Response) -> String {
    response
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "tunnel".to_string())
}

/// Probe with a scripted answer, for tests and dry runs.
#[derive(Debug, Clone)]
pub struct FixedProbe {
    result: Result<f64, ProbeError>,
    delay: Duration,
}

impl FixedProbe {
    /// Always reports `latency_ms`.
    pub fn latency(latency_ms: f64) -> Self {
        Self { result: Ok(latency_ms), delay: Duration::ZERO }
    }

    /// Always fails with `error`.
    pub fn failing(error: ProbeError) -> Self {
        Self { result: Err(error), delay: Duration::ZERO }
    }

    /// Wait `delay` before answering. A delay past the budget yields `Timeout`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Probe for FixedProbe {
    async fn probe(&self, _proxy: SocketAddr, budget: Duration) -> Result<f64, ProbeError> {
        if self.delay > budget {
            tokio::time::sleep(budget).await;
            return Err(ProbeError::Timeout);
        }
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn fixed_probe_respects_budget() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 1080));
        let probe = FixedProbe::latency(42.0);
        assert_eq!(probe.probe(addr, Duration::from_secs(1)).await, Ok(42.0));

        let slow = FixedProbe::latency(42.0).with_delay(Duration::from_millis(200));
        assert_eq!(slow.probe(addr, Duration::from_millis(20)).await, Err(ProbeError::Timeout));
    }

    #[test]
    fn failing_probe_reports_its_error() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 1080));
        let probe = FixedProbe::failing(ProbeError::Unreachable("reset".into()));
        let err = tokio_test::assert_err!(tokio_test::block_on(probe.probe(addr, Duration::ZERO)));
        assert_eq!(err, ProbeError::Unreachable("reset".into()));
    }

    #[tokio::test]
    async fn http_probe_reports_dead_tunnel_as_unreachable() {
        // Bind then drop to get a local port with nothing listening on it.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ValidatorConfig::builder().probe_url("http://example.com/").build();
        let probe = HttpProbe::from_config(&config).unwrap();
        let result = probe.probe(addr, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ProbeError::Unreachable(_))), "{:?}", result);
    }
}
