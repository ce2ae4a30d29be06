//! Parsing of `vmess://`, `vless://` and `trojan://` links into connection descriptors.

use crate::error::ParseError;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// Protocol family of a proxy link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    VMess,
    VLess,
    Trojan,
}

impl ProxyKind {
    /// Protocol name as understood by V2Ray-style engines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::VMess => "vmess",
            ProxyKind::VLess => "vless",
            ProxyKind::Trojan => "trojan",
        }
    }

    fn scheme_prefix(&self) -> &'static str {
        match self {
            ProxyKind::VMess => "vmess://",
            ProxyKind::VLess => "vless://",
            ProxyKind::Trojan => "trojan://",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport carrying the proxy protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Ws,
    Grpc,
    H2,
    Kcp,
    Quic,
    /// Anything else, kept verbatim.
    Other(String),
}

impl Network {
    fn from_hint(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("tcp") => Network::Tcp,
            Some("ws") | Some("websocket") => Network::Ws,
            Some("grpc") | Some("gun") => Network::Grpc,
            Some("h2") | Some("http") => Network::H2,
            Some("kcp") | Some("mkcp") => Network::Kcp,
            Some("quic") => Network::Quic,
            Some(other) => Network::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::H2 => "h2",
            Network::Kcp => "kcp",
            Network::Quic => "quic",
            Network::Other(name) => name,
        }
    }
}

/// Transport-level security.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    None,
    Tls,
    Reality,
}

impl Security {
    fn from_hint(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("tls") | Some("xtls") => Security::Tls,
            Some("reality") => Security::Reality,
            _ => Security::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }
}

/// Transport hints attached to a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub network: Network,
    pub security: Security,
    /// Remaining protocol options (`path`, `host`, `sni`, `flow`, `aid`, ...).
    pub extra: BTreeMap<String, String>,
}

impl Transport {
    /// Look up an extra option, ignoring empty values.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// Normalized, immutable representation of a proxy link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    kind: ProxyKind,
    host: String,
    port: u16,
    identity: String,
    transport: Transport,
}

impl ConnectionDescriptor {
    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// UUID for VMess/VLESS, password for Trojan.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parse one link into a descriptor.
pub fn parse(link: &str) -> Result<ConnectionDescriptor, ParseError> {
    let link = link.trim();
    let lower = link.to_ascii_lowercase();

    let kind = [ProxyKind::VMess, ProxyKind::VLess, ProxyKind::Trojan]
        .into_iter()
        .find(|k| lower.starts_with(k.scheme_prefix()))
        .ok_or_else(|| ParseError::UnsupportedScheme(scheme_of(link)))?;

    let descriptor = match kind {
        ProxyKind::VMess => parse_vmess(&link[kind.scheme_prefix().len()..])?,
        ProxyKind::VLess | ProxyKind::Trojan => parse_url_link(kind, link)?,
    };
    validate(descriptor)
}

fn scheme_of(link: &str) -> String {
    match link.find("://") {
        Some(idx) => link[..idx].to_string(),
        None => link.chars().take(16).collect(),
    }
}

fn validate(descriptor: ConnectionDescriptor) -> Result<ConnectionDescriptor, ParseError> {
    if descriptor.host.is_empty() {
        return Err(ParseError::Malformed(format!("{} link has no host", descriptor.kind)));
    }
    if descriptor.port == 0 {
        return Err(ParseError::Malformed(format!("{} link has port 0", descriptor.kind)));
    }
    if descriptor.identity.is_empty() {
        return Err(ParseError::Malformed(format!(
            "{} link has no credentials",
            descriptor.kind
        )));
    }
    Ok(descriptor)
}

/// Share-link JSON carried inside `vmess://`. Numeric fields show up as either
/// numbers or strings depending on the client that produced the link.
#[derive(Debug, Deserialize)]
struct VmessPayload {
    add: Option<String>,
    port: Option<serde_json::Value>,
    id: Option<String>,
    aid: Option<serde_json::Value>,
    scy: Option<String>,
    net: Option<String>,
    #[serde(rename = "type")]
    header_type: Option<String>,
    tls: Option<String>,
    path: Option<String>,
    host: Option<String>,
    sni: Option<String>,
    ps: Option<String>,
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, ParseError> {
    let mut padded: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    STANDARD
        .decode(padded.as_bytes())
        .or_else(|_| URL_SAFE.decode(padded.as_bytes()))
        .map_err(|e| ParseError::Malformed(format!("vmess payload is not base64: {}", e)))
}

fn json_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_vmess(payload: &str) -> Result<ConnectionDescriptor, ParseError> {
    // Some clients append a `#remark` to the base64 blob.
    let payload = payload.split('#').next().unwrap_or_default();
    let decoded = decode_base64(payload)?;
    let vmess: VmessPayload = serde_json::from_slice(&decoded)
        .map_err(|e| ParseError::Malformed(format!("vmess payload is not JSON: {}", e)))?;

    let host = vmess
        .add
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ParseError::Malformed("vmess payload missing `add`".into()))?;
    let port = vmess
        .port
        .as_ref()
        .and_then(json_to_string)
        .ok_or_else(|| ParseError::Malformed("vmess payload missing `port`".into()))?;
    let port = parse_port(&port)?;
    let id = vmess
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ParseError::Malformed("vmess payload missing `id`".into()))?;

    let mut extra = BTreeMap::new();
    let aid = vmess
        .aid
        .as_ref()
        .and_then(json_to_string)
        .filter(|aid| !aid.is_empty())
        .unwrap_or_else(|| "0".into());
    if aid.parse::<u16>().is_err() {
        return Err(ParseError::Malformed(format!("vmess `aid` is not a number: {}", aid)));
    }
    extra.insert("aid".to_string(), aid);
    let scy = vmess.scy.filter(|s| !s.is_empty()).unwrap_or_else(|| "auto".into());
    extra.insert("scy".to_string(), scy);
    for (key, value) in [
        ("path", vmess.path),
        ("host", vmess.host),
        ("sni", vmess.sni),
        ("type", vmess.header_type),
        ("remark", vmess.ps),
    ] {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            extra.insert(key.to_string(), value);
        }
    }

    Ok(ConnectionDescriptor {
        kind: ProxyKind::VMess,
        host,
        port,
        identity: id,
        transport: Transport {
            network: Network::from_hint(vmess.net.as_deref()),
            security: Security::from_hint(vmess.tls.as_deref()),
            extra,
        },
    })
}

fn parse_port(raw: &str) -> Result<u16, ParseError> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(ParseError::Malformed(format!("invalid port: {}", raw))),
        Ok(port) => Ok(port),
    }
}

fn parse_url_link(kind: ProxyKind, link: &str) -> Result<ConnectionDescriptor, ParseError> {
    let url = Url::parse(link).map_err(|e| ParseError::Malformed(format!("{} link: {}", kind, e)))?;

    let identity = percent_decode(url.username());
    if identity.is_empty() {
        return Err(ParseError::Malformed(format!("{} link missing user info", kind)));
    }
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ParseError::Malformed(format!("{} link missing host", kind)))?;
    let port = url.port().unwrap_or(443);

    let mut extra = BTreeMap::new();
    let mut network = None;
    let mut security = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "type" | "net" => network = Some(value.into_owned()),
            "security" | "tls" => security = Some(value.into_owned()),
            _ => {
                extra.insert(key.into_owned(), value.into_owned());
            }
        }
    }
    if kind == ProxyKind::VLess {
        extra.entry("encryption".to_string()).or_insert_with(|| "none".to_string());
    }
    if let Some(remark) = url.fragment().filter(|f| !f.is_empty()) {
        extra.insert("remark".to_string(), percent_decode(remark));
    }

    // Trojan always runs over TLS unless the link says otherwise.
    let security = match (kind, security.as_deref()) {
        (ProxyKind::Trojan, None | Some("")) => Security::Tls,
        (_, hint) => Security::from_hint(hint),
    };

    Ok(ConnectionDescriptor {
        kind,
        host,
        port,
        identity,
        transport: Transport {
            network: Network::from_hint(network.as_deref()),
            security,
            extra,
        },
    })
}

fn percent_decode(raw: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", raw.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}
