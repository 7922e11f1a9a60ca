//! Share-link parser
//!
//! Turns one `vless://`, `ss://`, `vmess://` or `trojan://` line into a typed
//! [`ProxyConfig`]. Link generators in the wild disagree on base64 variants
//! and percent-encode unpredictably, so the base64 handling here is
//! deliberately lenient: percent-decode first, then try unpadded URL-safe,
//! padded standard, and padded URL-safe decoding in that order.

use std::borrow::Cow;

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::proxy::models::{ProxyConfig, SsConfig, TrojanConfig, VlessConfig, VmessConfig};

/// Failure while parsing a single share link. Callers skip the line and
/// continue; none of these abort a run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty or comment line")]
    EmptyOrComment,
    #[error("unsupported protocol in: {0}")]
    UnsupportedProtocol(String),
    #[error("malformed uri: {0}")]
    MalformedUri(String),
    #[error("invalid port in: {0}")]
    InvalidPort(String),
    #[error("base64 decode failed")]
    Base64DecodeFailed,
    #[error("userinfo must decode to method:password, got: {0}")]
    InvalidUserinfo(String),
    #[error("malformed vmess json: {0}")]
    MalformedJson(String),
    #[error("vmess field {0} is not a number or numeric string")]
    PortCoercionFailed(&'static str),
}

/// Parse a single line into a [`ProxyConfig`].
///
/// Blank lines and `#` comments fail with [`ParseError::EmptyOrComment`];
/// unknown schemes with [`ParseError::UnsupportedProtocol`].
pub fn parse(line: &str) -> Result<ProxyConfig, ParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Err(ParseError::EmptyOrComment);
    }

    if line.starts_with("vless://") {
        parse_vless(line).map(ProxyConfig::Vless)
    } else if line.starts_with("ss://") {
        parse_ss(line).map(ProxyConfig::ShadowSocks)
    } else if let Some(payload) = line.strip_prefix("vmess://") {
        parse_vmess(payload).map(ProxyConfig::Vmess)
    } else if line.starts_with("trojan://") {
        parse_trojan(line).map(ProxyConfig::Trojan)
    } else {
        Err(ParseError::UnsupportedProtocol(line.to_string()))
    }
}

fn parse_vless(raw: &str) -> Result<VlessConfig, ParseError> {
    let url = parse_url(raw)?;
    let server = host_of(&url, raw)?;
    let port = url.port().unwrap_or(443);

    Ok(VlessConfig {
        name: display_name(&url, &server, port),
        uuid: decode_component(url.username()),
        server,
        port,
        security: query_param(&url, "security"),
        network: query_param(&url, "type"),
        sni: query_param(&url, "sni"),
        host: query_param(&url, "host"),
        path: query_param(&url, "path"),
        fingerprint: query_param(&url, "fp"),
        encryption: query_param(&url, "encryption"),
        flow: query_param(&url, "flow"),
        public_key: query_param(&url, "pbk"),
        short_id: query_param(&url, "sid"),
    })
}

fn parse_ss(raw: &str) -> Result<SsConfig, ParseError> {
    let url = parse_url(raw)?;
    let server = host_of(&url, raw)?;
    let port = url.port().unwrap_or(8388);

    // userinfo is a base64 payload of "method:password"
    let decoded = decode_base64_lenient(url.username())?;
    let decoded = String::from_utf8_lossy(&decoded).into_owned();
    let fields: Vec<&str> = decoded.split(':').collect();
    if fields.len() != 2 {
        return Err(ParseError::InvalidUserinfo(decoded));
    }

    Ok(SsConfig {
        name: display_name(&url, &server, port),
        method: fields[0].to_string(),
        password: fields[1].to_string(),
        server,
        port,
    })
}

/// JSON payload embedded in a `vmess://` link
#[derive(Debug, Deserialize)]
struct VmessLink {
    #[serde(default)]
    add: String,
    #[serde(default)]
    aid: serde_json::Value,
    #[serde(default)]
    id: String,
    #[serde(default)]
    net: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    port: serde_json::Value,
    #[serde(default)]
    ps: String,
    #[serde(default)]
    scy: String,
    #[serde(default)]
    sni: String,
    #[serde(default)]
    tls: String,
    #[serde(default)]
    host: String,
}

fn parse_vmess(payload: &str) -> Result<VmessConfig, ParseError> {
    // anything after '#' is a fragment, not part of the base64 payload
    let payload = payload.split_once('#').map_or(payload, |(body, _)| body);

    let decoded = decode_base64_lenient(payload)?;
    let link: VmessLink =
        serde_json::from_slice(&decoded).map_err(|e| ParseError::MalformedJson(e.to_string()))?;

    let port = coerce_u16(&link.port, "port")?;
    let alter_id = coerce_u16(&link.aid, "aid")?;

    let name = if link.ps.is_empty() {
        format!("{}:{}", link.add, port)
    } else {
        link.ps
    };
    let cipher = if link.scy.is_empty() {
        "auto".to_string()
    } else {
        link.scy
    };

    Ok(VmessConfig {
        name,
        uuid: link.id,
        server: link.add,
        port,
        alter_id,
        cipher,
        network: link.net,
        tls: link.tls,
        sni: link.sni,
        host: link.host,
        path: link.path,
    })
}

fn parse_trojan(raw: &str) -> Result<TrojanConfig, ParseError> {
    let url = parse_url(raw)?;
    let server = host_of(&url, raw)?;
    let port = url.port().unwrap_or(443);

    let mut security = query_param(&url, "security");
    if security.is_empty() {
        // trojan is TLS unless the link says otherwise
        security = "tls".to_string();
    }

    Ok(TrojanConfig {
        name: display_name(&url, &server, port),
        password: decode_component(url.username()),
        server,
        port,
        security,
        network: query_param(&url, "type"),
        sni: query_param(&url, "sni"),
        host: query_param(&url, "host"),
        path: query_param(&url, "path"),
        fingerprint: query_param(&url, "fp"),
    })
}

fn parse_url(raw: &str) -> Result<Url, ParseError> {
    Url::parse(raw).map_err(|e| match e {
        url::ParseError::InvalidPort => ParseError::InvalidPort(raw.to_string()),
        other => ParseError::MalformedUri(other.to_string()),
    })
}

fn host_of(url: &Url, raw: &str) -> Result<String, ParseError> {
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| ParseError::MalformedUri(format!("missing host in: {raw}")))
}

/// First value of a query parameter, empty string when absent
fn query_param(url: &Url, key: &str) -> String {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// Fragment as display name, percent-decoded when possible; `host:port`
/// when the link carries no fragment.
fn display_name(url: &Url, server: &str, port: u16) -> String {
    match url.fragment() {
        Some(fragment) if !fragment.is_empty() => decode_component(fragment),
        _ => format!("{server}:{port}"),
    }
}

/// Percent-decode, keeping the raw text when decoding fails
fn decode_component(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| raw.to_string())
}

/// Lenient base64: percent-decode, then try unpadded URL-safe, padded
/// standard, padded URL-safe. The first decode that succeeds wins.
fn decode_base64_lenient(input: &str) -> Result<Vec<u8>, ParseError> {
    let input = urlencoding::decode(input)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| input.to_string());

    let mut padded = input.clone();
    match input.len() % 4 {
        2 => padded.push_str("=="),
        3 => padded.push('='),
        _ => {}
    }

    URL_SAFE_NO_PAD
        .decode(input.as_bytes())
        .or_else(|_| STANDARD.decode(padded.as_bytes()))
        .or_else(|_| URL_SAFE.decode(padded.as_bytes()))
        .map_err(|_| ParseError::Base64DecodeFailed)
}

/// Coerce a JSON number, numeric string, empty string or null to u16.
/// Empty string and null coerce to 0; any other shape is an error.
fn coerce_u16(value: &serde_json::Value, field: &'static str) -> Result<u16, ParseError> {
    let n: i64 = match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or(ParseError::PortCoercionFailed(field))?,
        serde_json::Value::String(s) if s.is_empty() => 0,
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ParseError::PortCoercionFailed(field))?,
        serde_json::Value::Null => 0,
        _ => return Err(ParseError::PortCoercionFailed(field)),
    };
    u16::try_from(n).map_err(|_| ParseError::PortCoercionFailed(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_vless_full() {
        let line = "vless://uuid-1234@1.2.3.4:443?security=tls&sni=example.com&type=ws&host=cdn.example.com&path=%2Fws&fp=chrome&flow=xtls-rprx-vision#MyNode";
        let config = parse(line).unwrap();
        let ProxyConfig::Vless(c) = config else {
            panic!("expected vless variant");
        };
        assert_eq!(c.uuid, "uuid-1234");
        assert_eq!(c.server, "1.2.3.4");
        assert_eq!(c.port, 443);
        assert_eq!(c.security, "tls");
        assert_eq!(c.sni, "example.com");
        assert_eq!(c.network, "ws");
        assert_eq!(c.host, "cdn.example.com");
        assert_eq!(c.path, "/ws");
        assert_eq!(c.fingerprint, "chrome");
        assert_eq!(c.flow, "xtls-rprx-vision");
        assert_eq!(c.name, "MyNode");
    }

    #[test]
    fn test_parse_vless_reality_params() {
        let line = "vless://u@h.example:8443?security=reality&pbk=thepubkey&sid=ab12&fp=firefox#r";
        let ProxyConfig::Vless(c) = parse(line).unwrap() else {
            panic!("expected vless variant");
        };
        assert_eq!(c.security, "reality");
        assert_eq!(c.public_key, "thepubkey");
        assert_eq!(c.short_id, "ab12");
        assert_eq!(c.fingerprint, "firefox");
    }

    #[test]
    fn test_vless_defaults() {
        let ProxyConfig::Vless(c) = parse("vless://u@1.2.3.4").unwrap() else {
            panic!("expected vless variant");
        };
        assert_eq!(c.port, 443);
        assert_eq!(c.security, "");
        assert_eq!(c.encryption, "");
        // no fragment: name falls back to host:port
        assert_eq!(c.name, "1.2.3.4:443");
    }

    #[test]
    fn test_vless_percent_encoded_fragment() {
        let ProxyConfig::Vless(c) = parse("vless://u@1.2.3.4:443#My%20Node%20%F0%9F%87%A9%F0%9F%87%AA").unwrap()
        else {
            panic!("expected vless variant");
        };
        assert_eq!(c.name, "My Node 🇩🇪");
    }

    #[test]
    fn test_parse_trojan_defaults_to_tls() {
        let ProxyConfig::Trojan(c) = parse("trojan://secret@5.6.7.8#t").unwrap() else {
            panic!("expected trojan variant");
        };
        assert_eq!(c.password, "secret");
        assert_eq!(c.port, 443);
        assert_eq!(c.security, "tls");
    }

    #[test]
    fn test_parse_trojan_explicit_security() {
        let line = "trojan://pw@h.example:8443?security=reality&sni=x.com&type=grpc&path=svc#n";
        let ProxyConfig::Trojan(c) = parse(line).unwrap() else {
            panic!("expected trojan variant");
        };
        assert_eq!(c.security, "reality");
        assert_eq!(c.sni, "x.com");
        assert_eq!(c.network, "grpc");
        assert_eq!(c.path, "svc");
    }

    #[test]
    fn test_parse_ss_roundtrip() {
        let userinfo = URL_SAFE_NO_PAD.encode("aes-256-gcm:hunter2");
        let line = format!("ss://{userinfo}@9.9.9.9:8388#SS%20Node");
        let ProxyConfig::ShadowSocks(c) = parse(&line).unwrap() else {
            panic!("expected shadowsocks variant");
        };
        assert_eq!(c.method, "aes-256-gcm");
        assert_eq!(c.password, "hunter2");
        assert_eq!(c.server, "9.9.9.9");
        assert_eq!(c.port, 8388);
        assert_eq!(c.name, "SS Node");
    }

    #[test]
    fn test_parse_ss_default_port() {
        let userinfo = URL_SAFE_NO_PAD.encode("chacha20-ietf-poly1305:pw");
        let ProxyConfig::ShadowSocks(c) = parse(&format!("ss://{userinfo}@host.example")).unwrap()
        else {
            panic!("expected shadowsocks variant");
        };
        assert_eq!(c.port, 8388);
        assert_eq!(c.name, "host.example:8388");
    }

    #[test]
    fn test_base64_variants_decode_identically() {
        let plaintext = "aes-128-gcm:s3cr3t+pw/x";
        for encoded in [
            URL_SAFE_NO_PAD.encode(plaintext),
            STANDARD.encode(plaintext),
            URL_SAFE.encode(plaintext),
        ] {
            let decoded = decode_base64_lenient(&encoded).unwrap();
            assert_eq!(String::from_utf8(decoded).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_base64_percent_encoded_padding() {
        // '=' often arrives percent-encoded as %3D
        let encoded = STANDARD.encode("method:pw").replace('=', "%3D");
        let decoded = decode_base64_lenient(&encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "method:pw");
    }

    #[test]
    fn test_base64_garbage_fails() {
        assert_eq!(
            decode_base64_lenient("!!not base64!!"),
            Err(ParseError::Base64DecodeFailed)
        );
    }

    #[test]
    fn test_ss_userinfo_wrong_arity() {
        // one field
        let one = URL_SAFE_NO_PAD.encode("justamethod");
        assert!(matches!(
            parse(&format!("ss://{one}@1.2.3.4:8388")),
            Err(ParseError::InvalidUserinfo(_))
        ));
        // three fields
        let three = URL_SAFE_NO_PAD.encode("method:pass:extra");
        assert!(matches!(
            parse(&format!("ss://{three}@1.2.3.4:8388")),
            Err(ParseError::InvalidUserinfo(_))
        ));
    }

    fn vmess_line(payload: &serde_json::Value) -> String {
        format!("vmess://{}", STANDARD.encode(payload.to_string()))
    }

    #[test]
    fn test_parse_vmess_roundtrip() {
        let line = vmess_line(&json!({
            "add": "7.7.7.7",
            "port": 8443,
            "id": "aabb-ccdd",
            "aid": 0,
            "net": "ws",
            "path": "/tunnel",
            "host": "front.example.com",
            "ps": "VM Node",
            "scy": "chacha20-poly1305",
            "sni": "front.example.com",
            "tls": "tls"
        }));
        let ProxyConfig::Vmess(c) = parse(&line).unwrap() else {
            panic!("expected vmess variant");
        };
        assert_eq!(c.server, "7.7.7.7");
        assert_eq!(c.port, 8443);
        assert_eq!(c.uuid, "aabb-ccdd");
        assert_eq!(c.alter_id, 0);
        assert_eq!(c.network, "ws");
        assert_eq!(c.path, "/tunnel");
        assert_eq!(c.host, "front.example.com");
        assert_eq!(c.name, "VM Node");
        assert_eq!(c.cipher, "chacha20-poly1305");
        assert_eq!(c.tls, "tls");
    }

    #[test]
    fn test_vmess_port_coercion_matrix() {
        // numeric string
        let line = vmess_line(&json!({"add": "h", "id": "u", "port": "443", "aid": "2"}));
        let ProxyConfig::Vmess(c) = parse(&line).unwrap() else {
            panic!("expected vmess variant");
        };
        assert_eq!(c.port, 443);
        assert_eq!(c.alter_id, 2);

        // empty string and null coerce to zero
        let line = vmess_line(&json!({"add": "h", "id": "u", "port": "", "aid": null}));
        let ProxyConfig::Vmess(c) = parse(&line).unwrap() else {
            panic!("expected vmess variant");
        };
        assert_eq!(c.port, 0);
        assert_eq!(c.alter_id, 0);

        // any other JSON type is a coercion failure
        let line = vmess_line(&json!({"add": "h", "id": "u", "port": true}));
        assert_eq!(parse(&line), Err(ParseError::PortCoercionFailed("port")));
        let line = vmess_line(&json!({"add": "h", "id": "u", "port": 1, "aid": []}));
        assert_eq!(parse(&line), Err(ParseError::PortCoercionFailed("aid")));
    }

    #[test]
    fn test_vmess_defaults() {
        let line = vmess_line(&json!({"add": "8.8.8.8", "id": "u", "port": 443}));
        let ProxyConfig::Vmess(c) = parse(&line).unwrap() else {
            panic!("expected vmess variant");
        };
        assert_eq!(c.cipher, "auto");
        assert_eq!(c.name, "8.8.8.8:443");
        assert_eq!(c.tls, "");
    }

    #[test]
    fn test_vmess_fragment_is_stripped() {
        let encoded = STANDARD.encode(json!({"add": "h", "id": "u", "port": 1}).to_string());
        let config = parse(&format!("vmess://{encoded}#ignored")).unwrap();
        assert_eq!(config.server(), "h");
    }

    #[test]
    fn test_vmess_bad_json() {
        let line = format!("vmess://{}", STANDARD.encode("not json at all"));
        assert!(matches!(parse(&line), Err(ParseError::MalformedJson(_))));
    }

    #[test]
    fn test_empty_and_comment_lines() {
        assert_eq!(parse(""), Err(ParseError::EmptyOrComment));
        assert_eq!(parse("   "), Err(ParseError::EmptyOrComment));
        assert_eq!(parse("#comment"), Err(ParseError::EmptyOrComment));
        assert_eq!(parse("  # indented comment"), Err(ParseError::EmptyOrComment));
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            parse("socks5://1.2.3.4:1080"),
            Err(ParseError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            parse("whatever"),
            Err(ParseError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_invalid_port_is_tagged() {
        assert!(matches!(
            parse("vless://u@1.2.3.4:99999"),
            Err(ParseError::InvalidPort(_))
        ));
    }
}
