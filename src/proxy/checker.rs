//! Liveness checker and bounded-concurrency orchestrator
//!
//! This module provides functionality for:
//! - Checking one configuration end to end: allocate a local port, run the
//!   engine on it, wait for readiness, probe through the SOCKS5 inbound
//! - Running many checks under a fixed worker pool while preserving the
//!   input order in the returned results
//! - Reporting live progress through a serialized callback

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::proxy::engine::{self, EngineProcess};
use crate::proxy::models::{CheckResult, ProxyConfig};

/// Default number of concurrent workers
const DEFAULT_WORKERS: usize = 5;

/// Default timeout for a single probe request
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default engine binary driven per check
const DEFAULT_ENGINE_BIN: &str = "xray";

/// Geolocation endpoint probed through each proxy
const DEFAULT_PROBE_URL: &str = "http://ip-api.com/json";

/// How long to wait for the engine's SOCKS5 inbound to accept connections
const READINESS_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between readiness probes
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connect timeout of a single readiness probe
const READINESS_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Per-step failure while checking one configuration. The formatted message
/// ends up verbatim in [`CheckResult::error`].
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("no free port: {0}")]
    PortAllocation(String),
    #[error("engine start: {0}")]
    EngineStart(String),
    #[error("engine not ready: {0}")]
    EngineNotReady(String),
    #[error("socks5 client: {0}")]
    ClientBuild(String),
    #[error("http get: {0}")]
    Probe(String),
    #[error("response parse: {0}")]
    MalformedResponse(String),
    #[error("geo api: {0}")]
    GeoApi(String),
}

/// Response shape of the geolocation endpoint
#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(default)]
    query: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

/// Progress callback, invoked serialized under the run lock after each
/// result with `(result, completed_so_far, total)`.
pub type ProgressFn = dyn Fn(&CheckResult, usize, usize) + Send + Sync;

/// Configuration for the proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Number of concurrent workers (minimum 1 is enforced at run time)
    pub workers: usize,
    /// Timeout for the probe request of each check
    pub timeout: Duration,
    /// Engine binary to spawn per check
    pub engine_bin: String,
    /// URL probed through each proxy
    pub probe_url: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            engine_bin: DEFAULT_ENGINE_BIN.to_string(),
            probe_url: DEFAULT_PROBE_URL.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_engine_bin(mut self, bin: String) -> Self {
        self.engine_bin = bin;
        self
    }

    pub fn with_probe_url(mut self, url: String) -> Self {
        self.probe_url = url;
        self
    }
}

/// Mutable state shared by the workers of one run, guarded by one mutex
struct RunState {
    slots: Vec<Option<CheckResult>>,
    completed: usize,
}

/// Checker driving one engine subprocess per configuration
#[derive(Clone)]
pub struct ProxyChecker {
    config: CheckerConfig,
}

impl ProxyChecker {
    /// Create a checker with default configuration
    pub fn new() -> Self {
        Self {
            config: CheckerConfig::default(),
        }
    }

    /// Create a checker with custom configuration
    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    /// Check a single configuration. `index` is its 1-based input position.
    ///
    /// Never fails outward: every failed step yields a dead result tagged
    /// with that step's error. The engine subprocess is stopped on every
    /// path out of this function.
    pub async fn check_one(&self, index: usize, config: &ProxyConfig) -> CheckResult {
        let socks_port = match free_port().await {
            Ok(port) => port,
            Err(e) => {
                return CheckResult::dead(
                    index,
                    config,
                    CheckError::PortAllocation(e.to_string()).to_string(),
                )
            }
        };
        log::debug!("checking #{index} {config} through local port {socks_port}");

        let document = engine::build_config(config, socks_port);
        let mut process = match EngineProcess::spawn(&self.config.engine_bin, &document).await {
            Ok(process) => process,
            Err(e) => {
                // {:#} prints the whole context chain
                return CheckResult::dead(
                    index,
                    config,
                    CheckError::EngineStart(format!("{e:#}")).to_string(),
                )
            }
        };

        let outcome = self.probe(socks_port).await;
        process.stop().await;

        match outcome {
            Ok((latency, exit_ip, country)) => {
                CheckResult::alive(index, config, latency, exit_ip, country)
            }
            Err(e) => CheckResult::dead(index, config, e.to_string()),
        }
    }

    /// Wait for the SOCKS5 inbound, then issue one GET through it.
    /// Latency covers the request up to the response headers.
    async fn probe(&self, socks_port: u16) -> Result<(Duration, String, String), CheckError> {
        wait_for_port(socks_port, READINESS_TIMEOUT).await?;

        // socks5h: hostnames resolve through the tunnel, not locally
        let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{socks_port}"))
            .map_err(|e| CheckError::ClientBuild(e.to_string()))?;
        let client = Client::builder()
            .proxy(proxy)
            .timeout(self.config.timeout)
            .build()
            .map_err(|e| CheckError::ClientBuild(e.to_string()))?;

        let start = Instant::now();
        let response = client
            .get(&self.config.probe_url)
            .send()
            .await
            .map_err(|e| CheckError::Probe(e.to_string()))?;
        let latency = start.elapsed();

        let body = response
            .text()
            .await
            .map_err(|e| CheckError::Probe(e.to_string()))?;
        let geo: GeoResponse =
            serde_json::from_str(&body).map_err(|e| CheckError::MalformedResponse(e.to_string()))?;
        if geo.status != "success" {
            return Err(CheckError::GeoApi(geo.message));
        }

        Ok((latency, geo.query, geo.country))
    }

    /// Check every configuration under a fixed worker pool.
    ///
    /// The returned vector has the same length and order as `configs`, with
    /// `results[i].index == i + 1`, regardless of completion order across
    /// workers. `on_result` (when given) is invoked once per finished check,
    /// serialized, with a completed count that is accurate at call time.
    /// Blocks until every configuration has been checked.
    pub async fn check_all(
        &self,
        configs: Vec<ProxyConfig>,
        on_result: Option<Arc<ProgressFn>>,
    ) -> Vec<CheckResult> {
        let total = configs.len();
        let workers = self.config.workers.max(1);

        let configs = Arc::new(configs);
        let cursor = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(Mutex::new(RunState {
            slots: vec![None; total],
            completed: 0,
        }));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let checker = self.clone();
                let configs = Arc::clone(&configs);
                let cursor = Arc::clone(&cursor);
                let state = Arc::clone(&state);
                let on_result = on_result.clone();
                tokio::spawn(async move {
                    loop {
                        // the shared queue: each worker claims the next index
                        let idx = cursor.fetch_add(1, Ordering::SeqCst);
                        if idx >= configs.len() {
                            break;
                        }
                        let result = checker.check_one(idx + 1, &configs[idx]).await;

                        let mut state = state.lock().expect("run state lock poisoned");
                        state.completed += 1;
                        if let Some(callback) = &on_result {
                            callback(&result, state.completed, total);
                        }
                        state.slots[idx] = Some(result);
                    }
                })
            })
            .collect();

        join_all(handles).await;

        let mut state = state.lock().expect("run state lock poisoned");
        state
            .slots
            .drain(..)
            .map(|slot| slot.expect("every claimed slot is written before its worker exits"))
            .collect()
    }
}

impl Default for ProxyChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Reserve a currently-free local TCP port by binding a transient listener
/// and releasing it. Another process can take the port between release and
/// the engine binding it; that narrow race is accepted and not mitigated.
async fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Poll `127.0.0.1:<port>` until it accepts a connection or `deadline`
/// elapses.
async fn wait_for_port(port: u16, deadline: Duration) -> Result<(), CheckError> {
    let addr = format!("127.0.0.1:{port}");
    let start = Instant::now();
    while start.elapsed() < deadline {
        match tokio::time::timeout(READINESS_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(_)) | Err(_) => tokio::time::sleep(READINESS_POLL_INTERVAL).await,
        }
    }
    Err(CheckError::EngineNotReady(format!(
        "timeout waiting for {addr}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::SsConfig;

    fn sample_config(i: usize) -> ProxyConfig {
        ProxyConfig::ShadowSocks(SsConfig {
            name: format!("node-{i}"),
            method: "aes-256-gcm".to_string(),
            password: "secret".to_string(),
            server: "192.0.2.1".to_string(),
            port: 8388,
        })
    }

    /// A checker whose engine cannot even spawn; checks fail fast with a
    /// start error and no network traffic.
    fn failing_checker(workers: usize) -> ProxyChecker {
        ProxyChecker::with_config(
            CheckerConfig::new()
                .with_workers(workers)
                .with_engine_bin("vpn-checker-no-such-engine".to_string()),
        )
    }

    #[tokio::test]
    async fn test_check_all_preserves_length_and_order() {
        let configs: Vec<_> = (0..7).map(sample_config).collect();
        let results = failing_checker(3).check_all(configs, None).await;

        assert_eq!(results.len(), 7);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i + 1);
            assert_eq!(result.name, format!("node-{i}"));
            assert!(!result.alive);
            assert!(result.error.is_some());
        }
    }

    #[tokio::test]
    async fn test_check_all_with_more_workers_than_configs() {
        let configs: Vec<_> = (0..2).map(sample_config).collect();
        let results = failing_checker(16).check_all(configs, None).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 1);
        assert_eq!(results[1].index, 2);
    }

    #[tokio::test]
    async fn test_check_all_zero_workers_is_clamped() {
        let configs: Vec<_> = (0..3).map(sample_config).collect();
        let results = failing_checker(0).check_all(configs, None).await;
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_callback_is_serialized_and_monotonic() {
        let total = 6;
        let configs: Vec<_> = (0..total).map(sample_config).collect();

        let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let callback: Arc<ProgressFn> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |_result, completed, total| {
                seen.lock().unwrap().push((completed, total));
            })
        };

        let results = failing_checker(4).check_all(configs, Some(callback)).await;
        assert_eq!(results.len(), total);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), total);
        for (i, (completed, reported_total)) in seen.iter().enumerate() {
            assert_eq!(*completed, i + 1);
            assert_eq!(*reported_total, total);
        }
    }

    #[tokio::test]
    async fn test_missing_engine_binary_reports_start_error() {
        let result = failing_checker(1).check_one(1, &sample_config(0)).await;
        assert!(!result.alive);
        let error = result.error.expect("dead result carries an error");
        assert!(error.contains("engine start"), "unexpected error: {error}");
    }

    #[tokio::test]
    async fn test_engine_that_never_listens_reports_not_ready() {
        // `true` spawns fine, ignores its arguments and exits without ever
        // opening the allocated port
        let checker = ProxyChecker::with_config(
            CheckerConfig::new().with_engine_bin("true".to_string()),
        );
        let result = checker.check_one(1, &sample_config(0)).await;
        assert!(!result.alive);
        assert!(result.latency.is_none());
        let error = result.error.expect("dead result carries an error");
        assert!(
            error.contains("engine not ready"),
            "unexpected error: {error}"
        );
    }

    #[tokio::test]
    async fn test_free_port_is_immediately_bindable() {
        let port = free_port().await.unwrap();
        assert!(port > 0);
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_port_succeeds_on_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_for_port(port, Duration::from_secs(1)).await.unwrap();
    }
}
