//! Engine document builder and subprocess supervisor
//!
//! This module provides functionality for:
//! - Building the declarative JSON document that exposes one parsed config
//!   as a local SOCKS5 inbound of the external proxy engine
//! - Spawning the engine with the document delivered over stdin
//! - Stopping the engine without leaking the subprocess

use std::process::Stdio;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::proxy::models::{ProxyConfig, SsConfig, TrojanConfig, VlessConfig, VmessConfig};
use crate::Result;

/// Build the engine document for `config`, listening on
/// `127.0.0.1:<socks_port>` as an unauthenticated SOCKS5 inbound.
pub fn build_config(config: &ProxyConfig, socks_port: u16) -> Value {
    match config {
        ProxyConfig::Vless(c) => vless_document(c, socks_port),
        ProxyConfig::ShadowSocks(c) => ss_document(c, socks_port),
        ProxyConfig::Vmess(c) => vmess_document(c, socks_port),
        ProxyConfig::Trojan(c) => trojan_document(c, socks_port),
    }
}

fn engine_document(
    socks_port: u16,
    protocol: &str,
    settings: Value,
    stream_settings: Option<Value>,
) -> Value {
    let mut outbound = json!({
        "protocol": protocol,
        "settings": settings,
    });
    if let Some(stream) = stream_settings {
        outbound["streamSettings"] = stream;
    }

    json!({
        "log": { "loglevel": "none" },
        "inbounds": [inbound(socks_port)],
        "outbounds": [outbound],
    })
}

fn inbound(socks_port: u16) -> Value {
    json!({
        "listen": "127.0.0.1",
        "port": socks_port,
        "protocol": "socks",
        "settings": {
            "auth": "noauth",
            "udp": false,
        },
    })
}

/// Transport-layer block shared by the stream-based protocols
fn stream_settings(
    network: &str,
    security: &str,
    sni: &str,
    host: &str,
    path: &str,
    fingerprint: &str,
) -> Value {
    let mut stream = json!({
        "network": network,
        "security": security,
    });

    match security {
        "tls" => {
            let mut tls = json!({ "serverName": sni });
            if !fingerprint.is_empty() {
                tls["fingerprint"] = json!(fingerprint);
            }
            stream["tlsSettings"] = tls;
        }
        "reality" => {
            stream["realitySettings"] = json!({
                "serverName": sni,
                "fingerprint": fingerprint,
            });
        }
        _ => {}
    }

    match network {
        "ws" => {
            stream["wsSettings"] = json!({
                "path": path,
                "headers": { "Host": host },
            });
        }
        "grpc" => {
            stream["grpcSettings"] = json!({ "serviceName": path });
        }
        "http" | "h2" => {
            stream["httpSettings"] = json!({ "path": path, "host": [host] });
        }
        "httpupgrade" => {
            stream["httpupgradeSettings"] = json!({ "path": path, "host": host });
        }
        "xhttp" | "splithttp" => {
            stream["xhttpSettings"] = json!({ "path": path, "host": host });
        }
        _ => {}
    }

    stream
}

fn vless_document(c: &VlessConfig, socks_port: u16) -> Value {
    let mut stream = stream_settings(
        &c.network,
        &c.security,
        &c.sni,
        &c.host,
        &c.path,
        &c.fingerprint,
    );

    // Reality additionally needs the server's public key and short id
    if c.security == "reality" && !c.public_key.is_empty() {
        stream["realitySettings"] = json!({
            "serverName": c.sni,
            "fingerprint": c.fingerprint,
            "publicKey": c.public_key,
            "shortId": c.short_id,
        });
    }

    let encryption = if c.encryption.is_empty() {
        "none"
    } else {
        c.encryption.as_str()
    };
    let mut user = json!({ "id": c.uuid, "encryption": encryption });
    if !c.flow.is_empty() {
        user["flow"] = json!(c.flow);
    }

    let settings = json!({
        "vnext": [{
            "address": c.server,
            "port": c.port,
            "users": [user],
        }],
    });
    engine_document(socks_port, "vless", settings, Some(stream))
}

fn ss_document(c: &SsConfig, socks_port: u16) -> Value {
    let settings = json!({
        "servers": [{
            "address": c.server,
            "port": c.port,
            "method": c.method,
            "password": c.password,
        }],
    });
    engine_document(socks_port, "shadowsocks", settings, None)
}

fn vmess_document(c: &VmessConfig, socks_port: u16) -> Value {
    let security = if c.tls == "tls" { "tls" } else { "" };
    let stream = stream_settings(&c.network, security, &c.sni, &c.host, &c.path, "");

    let settings = json!({
        "vnext": [{
            "address": c.server,
            "port": c.port,
            "users": [{
                "id": c.uuid,
                "alterId": c.alter_id,
                "security": c.cipher,
            }],
        }],
    });
    engine_document(socks_port, "vmess", settings, Some(stream))
}

fn trojan_document(c: &TrojanConfig, socks_port: u16) -> Value {
    let stream = stream_settings(
        &c.network,
        &c.security,
        &c.sni,
        &c.host,
        &c.path,
        &c.fingerprint,
    );

    let settings = json!({
        "servers": [{
            "address": c.server,
            "port": c.port,
            "password": c.password,
        }],
    });
    engine_document(socks_port, "trojan", settings, Some(stream))
}

/// Handle to a running engine subprocess.
///
/// The child is spawned with `kill_on_drop`, so even a panicking check
/// cannot leak it; [`EngineProcess::stop`] remains the normal shutdown path.
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    /// Spawn `bin` and feed it `document` over stdin; no temporary config
    /// file is written.
    pub async fn spawn(bin: &str, document: &Value) -> Result<Self> {
        let mut child = Command::new(bin)
            .args(["run", "-config", "stdin:"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {bin}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(document).context("serialize engine document")?;
            // A write failure means the engine died instantly; the readiness
            // probe reports that, not this write.
            let _ = stdin.write_all(&payload).await;
        }

        Ok(Self { child })
    }

    /// Stop the engine and wait for it to exit. Idempotent; safe on a
    /// process that already exited.
    pub async fn stop(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}
