//! HTTP republisher for alive configs
//!
//! After a run, serves the alive results paired with their original raw
//! URIs: an HTML table on `/` and the plain URI list on `/configs`.

use std::convert::Infallible;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::proxy::CheckResult;
use crate::Result;

/// An alive check result paired with the raw URI it was parsed from.
#[derive(Debug, Clone)]
pub struct AliveEntry {
    pub result: CheckResult,
    pub raw_uri: String,
}

/// Serve `entries` on `addr` until the process is killed.
pub async fn serve(addr: &str, entries: Vec<AliveEntry>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    let entries = Arc::new(entries);

    loop {
        let (stream, peer) = listener.accept().await?;
        let entries = Arc::clone(&entries);
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, Arc::clone(&entries)));
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                log::debug!("connection from {peer} failed: {err}");
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    entries: Arc<Vec<AliveEntry>>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/" => respond(render_index(&entries), "text/html; charset=utf-8"),
        "/configs" => respond(configs_body(&entries), "text/plain; charset=utf-8"),
        _ => {
            let mut response = respond("not found".to_string(), "text/plain; charset=utf-8");
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };
    Ok(response)
}

fn respond(body: String, content_type: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Raw URIs, one per line
fn configs_body(entries: &[AliveEntry]) -> String {
    entries
        .iter()
        .map(|e| e.raw_uri.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_index(entries: &[AliveEntry]) -> String {
    let mut rows = String::new();
    for (i, entry) in entries.iter().enumerate() {
        let result = &entry.result;
        let latency_ms = result.latency.map(|d| d.as_millis()).unwrap_or_default();
        let _ = write!(
            rows,
            "<tr><td>{}</td><td>{}</td>\
             <td><span class=\"badge {}\">{}</span></td>\
             <td class=\"server\">{}</td>\
             <td class=\"latency\">{}ms</td>\
             <td class=\"server\">{}</td><td>{}</td>\
             <td class=\"uri\" title=\"{}\">{}</td></tr>",
            i + 1,
            escape_html(&result.name),
            result.protocol,
            result.protocol,
            escape_html(&result.endpoint()),
            latency_ms,
            escape_html(result.exit_ip.as_deref().unwrap_or("-")),
            escape_html(result.country.as_deref().unwrap_or("-")),
            escape_html(&entry.raw_uri),
            escape_html(&truncate(&entry.raw_uri, 55)),
        );
    }

    // embedded as a JS array so "copy all" hands out the untruncated URIs
    let uris: Vec<&str> = entries.iter().map(|e| e.raw_uri.as_str()).collect();
    let uris_js = serde_json::to_string(&uris).unwrap_or_else(|_| "[]".to_string());

    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
         <title>vpn-checker — alive configs</title>\n<style>{STYLE}</style>\n</head>\n<body>\n\
         <h1>vpn-checker — alive configs</h1>\n\
         <p class=\"meta\">Generated {generated} · {count} alive · \
         <a href=\"/configs\">/configs (plain text)</a> · \
         <button onclick=\"copyAll()\">Copy all URIs</button></p>\n\
         <table>\n<thead><tr><th>#</th><th>Name</th><th>Protocol</th><th>Server</th>\
         <th>Latency</th><th>Exit IP</th><th>Country</th><th>URI</th></tr></thead>\n\
         <tbody>{rows}</tbody>\n</table>\n\
         <script>\nvar allURIs = {uris_js};\n\
         function copyAll() {{ navigator.clipboard.writeText(allURIs.join('\\n')); }}\n\
         </script>\n</body>\n</html>",
        generated = Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        count = entries.len(),
    )
}

const STYLE: &str = "\
body{font-family:system-ui,sans-serif;background:#0d1117;color:#c9d1d9;padding:2rem}\
h1{font-size:1.4rem;color:#58a6ff;margin-bottom:.25rem}\
.meta{font-size:.82rem;color:#8b949e;margin-bottom:1.25rem}\
a{color:#58a6ff}\
table{width:100%;border-collapse:collapse;font-size:.83rem}\
th{background:#161b22;color:#8b949e;text-align:left;padding:.5rem .75rem}\
td{padding:.45rem .75rem;border-bottom:1px solid #161b22}\
tr:hover td{background:#161b22}\
.badge{padding:.15rem .55rem;border-radius:12px;font-size:.72rem;font-weight:700}\
.badge.vless{background:#1a3a6e;color:#79c0ff}\
.badge.shadowsocks{background:#0d3326;color:#56d364}\
.badge.vmess{background:#3a2010;color:#ffa657}\
.badge.trojan{background:#2d1a4a;color:#d2a8ff}\
.latency{color:#3fb950}\
.server,.uri{font-family:monospace;font-size:.76rem;color:#8b949e}";

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn truncate(s: &str, max: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max {
        s.to_string()
    } else {
        let mut out: String = chars[..max - 1].iter().collect();
        out.push('…');
        out
    }
}
