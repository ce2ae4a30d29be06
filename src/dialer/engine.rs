//! Dialer backed by an external V2Ray/Xray-compatible engine process.
//!
//! For every dial a JSON configuration is rendered into a temp file, the engine is
//! spawned against it, and the local SOCKS inbound is polled until it accepts
//! connections. The process, the temp file and the port lease all belong to the
//! returned [`EngineTunnel`].

use super::ports::{PortLease, PortPool};
use super::{Dialer, TunnelHandle};
use crate::error::DialError;
use crate::link::{ConnectionDescriptor, Network, ProxyKind, Security};
use crate::retry::{Attempt, PollError, RetryPolicy};

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value};
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{self, Instant};

/// Placeholder replaced by the config file path in engine arguments.
pub const CONFIG_PLACEHOLDER: &str = "{config}";

const PREFLIGHT_LIMIT: Duration = Duration::from_secs(5);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings for [`EngineDialer`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine executable.
    pub executable: PathBuf,
    /// Arguments; `{config}` is replaced with the generated config path.
    pub args: Vec<String>,
    /// Local ports available for SOCKS inbounds.
    pub port_range: RangeInclusive<u16>,
    /// Readiness polling for the local inbound.
    pub readiness: RetryPolicy,
    /// Open a plain TCP connection to the remote before spawning anything.
    pub preflight: bool,
}

impl EngineConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: vec!["run".into(), "-config".into(), CONFIG_PLACEHOLDER.into()],
            port_range: 20000..=40000,
            readiness: RetryPolicy::default(),
            preflight: false,
        }
    }
}

/// Locate an engine binary: `V2RAY_EXEC`, then well-known names on `PATH`.
pub fn locate_engine() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("V2RAY_EXEC").map(PathBuf::from) {
        if path.is_file() {
            return Some(path);
        }
        warn!("V2RAY_EXEC points to {} which is not a file", path.display());
    }

    let search = std::env::var_os("PATH")?;
    let names = ["xray", "v2ray", "xray.exe", "v2ray.exe"];
    std::env::split_paths(&search)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Dialer that drives an external engine process.
pub struct EngineDialer {
    config: EngineConfig,
    ports: Arc<PortPool>,
}

impl EngineDialer {
    pub fn new(config: EngineConfig) -> Self {
        let ports = PortPool::new(config.port_range.clone());
        Self { config, ports }
    }

    fn command(&self, config_path: &Path) -> Command {
        let mut cmd = Command::new(&self.config.executable);
        for arg in &self.config.args {
            if arg == CONFIG_PLACEHOLDER {
                cmd.arg(config_path);
            } else {
                cmd.arg(arg.replace(CONFIG_PLACEHOLDER, &config_path.to_string_lossy()));
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn preflight(
        &self,
        descriptor: &ConnectionDescriptor,
        limit: Duration,
    ) -> Result<(), DialError> {
        let target = (descriptor.host(), descriptor.port());
        match time::timeout(limit.min(PREFLIGHT_LIMIT), TcpStream::connect(target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DialError::Refused(format!("{}: {}", descriptor.authority(), e))),
            Err(_) => Err(DialError::Refused(format!(
                "{}: preflight connect timed out",
                descriptor.authority()
            ))),
        }
    }
}

#[async_trait]
impl Dialer for EngineDialer {
    async fn dial(
        &self,
        descriptor: &ConnectionDescriptor,
        budget: Duration,
    ) -> Result<Box<dyn TunnelHandle>, DialError> {
        let deadline = Instant::now() + budget;

        if self.config.preflight {
            self.preflight(descriptor, budget).await?;
        }

        let lease = self.ports.lease()?;
        let local_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, lease.port()));
        let rendered = render_config(descriptor, local_addr.port());
        let config_file = write_config(&rendered)?;

        let mut child = self.command(config_file.path()).spawn().map_err(|e| {
            DialError::ResourceUnavailable(format!(
                "cannot spawn {}: {}",
                self.config.executable.display(),
                e
            ))
        })?;
        debug!(
            "Spawned engine pid {:?} for {} on {}",
            child.id(),
            descriptor.authority(),
            local_addr
        );

        let policy = self
            .config
            .readiness
            .capped(deadline.saturating_duration_since(Instant::now()));
        let outcome = policy
            .poll_until(|| {
                let exited = child.try_wait();
                async move {
                    match exited {
                        Ok(Some(status)) => {
                            return Attempt::Abort(DialError::Refused(format!(
                                "engine exited early with {}",
                                status
                            )))
                        }
                        Err(e) => {
                            return Attempt::Abort(DialError::ResourceUnavailable(e.to_string()))
                        }
                        Ok(None) => {}
                    }
                    match TcpStream::connect(local_addr).await {
                        Ok(_) => Attempt::Ready(()),
                        Err(_) => Attempt::Pending,
                    }
                }
            })
            .await;

        let mut tunnel = EngineTunnel {
            local_addr,
            child: Some(child),
            config_file: Some(config_file),
            lease: Some(lease),
        };
        match outcome {
            Ok(()) => Ok(Box::new(tunnel)),
            Err(err) => {
                tunnel.close().await;
                Err(match err {
                    PollError::TimedOut => DialError::Timeout,
                    PollError::Aborted(e) => e,
                })
            }
        }
    }
}

fn write_config(config: &Value) -> Result<NamedTempFile, DialError> {
    let unavailable =
        |e: std::io::Error| DialError::ResourceUnavailable(format!("temp config: {}", e));
    let mut file = tempfile::Builder::new()
        .prefix("link-validator-")
        .suffix(".json")
        .tempfile()
        .map_err(unavailable)?;
    serde_json::to_writer_pretty(file.as_file_mut(), config)
        .map_err(|e| DialError::ResourceUnavailable(format!("temp config: {}", e)))?;
    file.as_file_mut().flush().map_err(unavailable)?;
    Ok(file)
}

/// Render a V2Ray/Xray configuration with one SOCKS inbound on `socks_port` and one
/// outbound for `descriptor`.
pub fn render_config(descriptor: &ConnectionDescriptor, socks_port: u16) -> Value {
    let transport = descriptor.transport();
    let settings = match descriptor.kind() {
        ProxyKind::VMess => json!({
            "vnext": [{
                "address": descriptor.host(),
                "port": descriptor.port(),
                "users": [{
                    "id": descriptor.identity(),
                    "alterId": transport
                        .get("aid")
                        .and_then(|a| a.parse::<u16>().ok())
                        .unwrap_or(0),
                    "security": transport.get("scy").unwrap_or("auto"),
                }]
            }]
        }),
        ProxyKind::VLess => {
            let mut user = json!({
                "id": descriptor.identity(),
                "encryption": transport.get("encryption").unwrap_or("none"),
            });
            if let Some(flow) = transport.get("flow") {
                user["flow"] = json!(flow);
            }
            json!({
                "vnext": [{
                    "address": descriptor.host(),
                    "port": descriptor.port(),
                    "users": [user]
                }]
            })
        }
        ProxyKind::Trojan => json!({
            "servers": [{
                "address": descriptor.host(),
                "port": descriptor.port(),
                "password": descriptor.identity(),
            }]
        }),
    };

    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "port": socks_port,
            "listen": "127.0.0.1",
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": false }
        }],
        "outbounds": [{
            "protocol": descriptor.kind().as_str(),
            "settings": settings,
            "streamSettings": stream_settings(descriptor),
        }]
    })
}

fn stream_settings(descriptor: &ConnectionDescriptor) -> Value {
    let transport = descriptor.transport();
    let mut stream = json!({
        "network": transport.network.as_str(),
        "security": transport.security.as_str(),
    });

    match transport.network {
        Network::Ws => {
            let mut ws = json!({ "path": transport.get("path").unwrap_or("/") });
            if let Some(host) = transport.get("host") {
                ws["headers"] = json!({ "Host": host });
            }
            stream["wsSettings"] = ws;
        }
        Network::Grpc => {
            stream["grpcSettings"] = json!({
                "serviceName": transport
                    .get("serviceName")
                    .or_else(|| transport.get("path"))
                    .unwrap_or(""),
            });
        }
        Network::H2 => {
            let mut h2 = json!({ "path": transport.get("path").unwrap_or("/") });
            if let Some(host) = transport.get("host") {
                h2["host"] = json!([host]);
            }
            stream["httpSettings"] = h2;
        }
        _ => {}
    }

    let server_name = transport
        .get("sni")
        .or_else(|| transport.get("host"))
        .unwrap_or(descriptor.host());
    match transport.security {
        Security::Tls => {
            let mut tls = json!({ "serverName": server_name });
            if let Some(fp) = transport.get("fp") {
                tls["fingerprint"] = json!(fp);
            }
            if let Some(alpn) = transport.get("alpn") {
                tls["alpn"] = json!(alpn.split(',').collect::<Vec<_>>());
            }
            stream["tlsSettings"] = tls;
        }
        Security::Reality => {
            stream["realitySettings"] = json!({
                "serverName": server_name,
                "publicKey": transport.get("pbk").unwrap_or(""),
                "shortId": transport.get("sid").unwrap_or(""),
                "fingerprint": transport.get("fp").unwrap_or("chrome"),
            });
        }
        Security::None => {}
    }
    stream
}

/// Tunnel served by a spawned engine process.
pub struct EngineTunnel {
    local_addr: SocketAddr,
    child: Option<Child>,
    config_file: Option<NamedTempFile>,
    lease: Option<PortLease>,
}

#[async_trait]
impl TunnelHandle for EngineTunnel {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn ready(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            if let Err(e) = child.start_kill() {
                debug!("Engine pid {:?} already gone: {}", pid, e);
            }
            if time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
                warn!("Engine pid {:?} did not exit within {:?}", pid, REAP_TIMEOUT);
            }
        }
        if let Some(file) = self.config_file.take() {
            if let Err(e) = file.close() {
                warn!("Failed to remove temp config: {}", e);
            }
        }
        self.lease.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;

    #[test]
    fn renders_vmess_ws_tls() {
        use base64::Engine;
        let json = r#"{"add":"a.example","port":443,"id":"00000000-0000-0000-0000-000000000000","aid":"2","net":"ws","tls":"tls","path":"/ray","host":"cdn.example"}"#;
        let link = format!("vmess://{}", base64::engine::general_purpose::STANDARD.encode(json));
        let desc = link::parse(&link).unwrap();

        let config = render_config(&desc, 21000);
        assert_eq!(config["inbounds"][0]["port"], 21000);
        assert_eq!(config["inbounds"][0]["protocol"], "socks");
        let out = &config["outbounds"][0];
        assert_eq!(out["protocol"], "vmess");
        assert_eq!(out["settings"]["vnext"][0]["address"], "a.example");
        assert_eq!(out["settings"]["vnext"][0]["users"][0]["alterId"], 2);
        assert_eq!(out["streamSettings"]["network"], "ws");
        assert_eq!(out["streamSettings"]["wsSettings"]["path"], "/ray");
        assert_eq!(out["streamSettings"]["wsSettings"]["headers"]["Host"], "cdn.example");
        assert_eq!(out["streamSettings"]["tlsSettings"]["serverName"], "cdn.example");
    }

    #[test]
    fn renders_vless_flow_and_trojan_password() {
        let desc = link::parse(
            "vless://00000000-0000-0000-0000-000000000000@v.example:8443?flow=xtls-rprx-vision&security=tls&sni=s.example",
        )
        .unwrap();
        let config = render_config(&desc, 21001);
        let user = &config["outbounds"][0]["settings"]["vnext"][0]["users"][0];
        assert_eq!(user["flow"], "xtls-rprx-vision");
        assert_eq!(user["encryption"], "none");
        let tls = &config["outbounds"][0]["streamSettings"]["tlsSettings"];
        assert_eq!(tls["serverName"], "s.example");

        let desc = link::parse("trojan://pw@t.example:443").unwrap();
        let config = render_config(&desc, 21002);
        assert_eq!(config["outbounds"][0]["settings"]["servers"][0]["password"], "pw");
        assert_eq!(config["outbounds"][0]["streamSettings"]["security"], "tls");
    }

    #[tokio::test]
    async fn missing_executable_is_resource_unavailable() {
        let mut config = EngineConfig::new("/nonexistent/engine-binary");
        config.port_range = 31000..=31999;
        let dialer = EngineDialer::new(config);
        let desc = link::parse("trojan://pw@127.0.0.1:9").unwrap();

        let err = dialer.dial(&desc, Duration::from_secs(2)).await.err().unwrap();
        assert!(matches!(err, DialError::ResourceUnavailable(_)));
        assert_eq!(dialer.ports.leased(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn engine_that_exits_is_refused_and_cleaned_up() {
        let mut config = EngineConfig::new("/bin/sh");
        config.args = vec!["-c".into(), "exit 3".into()];
        config.port_range = 32000..=32999;
        config.readiness = RetryPolicy::new(Duration::from_millis(50), Duration::from_secs(3));
        let dialer = EngineDialer::new(config);
        let desc = link::parse("trojan://pw@127.0.0.1:9").unwrap();

        let err = dialer.dial(&desc, Duration::from_secs(3)).await.err().unwrap();
        assert!(matches!(err, DialError::Refused(_)));
        assert_eq!(dialer.ports.leased(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn engine_that_never_listens_times_out() {
        let mut config = EngineConfig::new("/bin/sh");
        config.args = vec!["-c".into(), "sleep 30".into()];
        config.port_range = 33000..=33999;
        config.readiness = RetryPolicy::new(Duration::from_millis(50), Duration::from_millis(300));
        let dialer = EngineDialer::new(config);
        let desc = link::parse("trojan://pw@127.0.0.1:9").unwrap();

        let start = std::time::Instant::now();
        let err = dialer.dial(&desc, Duration::from_secs(5)).await.err().unwrap();
        assert_eq!(err, DialError::Timeout);
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(dialer.ports.leased(), 0);
    }
}
