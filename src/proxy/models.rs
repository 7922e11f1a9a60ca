//! Data models for parsed share links and check outcomes

use std::fmt;
use std::time::Duration;

/// Parsed `vless://` URI parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessConfig {
    pub name: String,
    pub uuid: String,
    pub server: String,
    pub port: u16,
    pub security: String,
    pub network: String,
    pub sni: String,
    pub host: String,
    pub path: String,
    pub fingerprint: String,
    pub encryption: String,
    pub flow: String,
    /// Reality public key (`pbk` query parameter)
    pub public_key: String,
    /// Reality short id (`sid` query parameter)
    pub short_id: String,
}

/// Parsed `ss://` URI parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsConfig {
    pub name: String,
    pub method: String,
    pub password: String,
    pub server: String,
    pub port: u16,
}

/// Parsed `vmess://` URI parameters (base64-wrapped JSON payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmessConfig {
    pub name: String,
    pub uuid: String,
    pub server: String,
    pub port: u16,
    pub alter_id: u16,
    /// Cipher: auto, aes-128-gcm, chacha20-poly1305, none
    pub cipher: String,
    /// Transport: tcp, ws, grpc, h2, kcp
    pub network: String,
    /// "tls" when TLS is enabled, empty otherwise
    pub tls: String,
    pub sni: String,
    pub host: String,
    pub path: String,
}

/// Parsed `trojan://` URI parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanConfig {
    pub name: String,
    pub password: String,
    pub server: String,
    pub port: u16,
    pub security: String,
    pub network: String,
    pub sni: String,
    pub host: String,
    pub path: String,
    pub fingerprint: String,
}

/// A parsed proxy configuration. The variant set is closed: parsing and
/// engine-document generation both switch exhaustively over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyConfig {
    Vless(VlessConfig),
    ShadowSocks(SsConfig),
    Vmess(VmessConfig),
    Trojan(TrojanConfig),
}

impl ProxyConfig {
    /// Display name of the node
    pub fn name(&self) -> &str {
        match self {
            ProxyConfig::Vless(c) => &c.name,
            ProxyConfig::ShadowSocks(c) => &c.name,
            ProxyConfig::Vmess(c) => &c.name,
            ProxyConfig::Trojan(c) => &c.name,
        }
    }

    /// Protocol tag used in reports and the engine document
    pub fn protocol(&self) -> &'static str {
        match self {
            ProxyConfig::Vless(_) => "vless",
            ProxyConfig::ShadowSocks(_) => "shadowsocks",
            ProxyConfig::Vmess(_) => "vmess",
            ProxyConfig::Trojan(_) => "trojan",
        }
    }

    /// Remote server host
    pub fn server(&self) -> &str {
        match self {
            ProxyConfig::Vless(c) => &c.server,
            ProxyConfig::ShadowSocks(c) => &c.server,
            ProxyConfig::Vmess(c) => &c.server,
            ProxyConfig::Trojan(c) => &c.server,
        }
    }

    /// Remote server port
    pub fn port(&self) -> u16 {
        match self {
            ProxyConfig::Vless(c) => c.port,
            ProxyConfig::ShadowSocks(c) => c.port,
            ProxyConfig::Vmess(c) => c.port,
            ProxyConfig::Trojan(c) => c.port,
        }
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}:{}",
            self.name(),
            self.protocol(),
            self.server(),
            self.port()
        )
    }
}

/// Outcome of checking a single configuration.
///
/// Exactly one of the two shapes holds: alive with latency and exit data, or
/// dead with an error message. The constructors below are the only way the
/// checker builds one.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// 1-based position of the configuration in the input
    pub index: usize,
    pub name: String,
    pub protocol: &'static str,
    pub server: String,
    pub port: u16,
    pub alive: bool,
    pub latency: Option<Duration>,
    pub exit_ip: Option<String>,
    pub country: Option<String>,
    pub error: Option<String>,
}

impl CheckResult {
    /// Build a successful result
    pub fn alive(
        index: usize,
        config: &ProxyConfig,
        latency: Duration,
        exit_ip: String,
        country: String,
    ) -> Self {
        Self {
            index,
            name: config.name().to_string(),
            protocol: config.protocol(),
            server: config.server().to_string(),
            port: config.port(),
            alive: true,
            latency: Some(latency),
            exit_ip: Some(exit_ip),
            country: Some(country),
            error: None,
        }
    }

    /// Build a failed result carrying the step's error text
    pub fn dead(index: usize, config: &ProxyConfig, error: String) -> Self {
        Self {
            index,
            name: config.name().to_string(),
            protocol: config.protocol(),
            server: config.server().to_string(),
            port: config.port(),
            alive: false,
            latency: None,
            exit_ip: None,
            country: None,
            error: Some(error),
        }
    }

    /// `host:port` of the checked server
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}
