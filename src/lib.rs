//! vpn-checker — share-link liveness checker
//!
//! Parses vless/ss/vmess/trojan share links, exposes each one as a local
//! SOCKS5 inbound through an external proxy engine subprocess, and probes
//! the tunnel with a real HTTP request to measure liveness and latency.

pub mod proxy;
pub mod web;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
