use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use vpn_checker::proxy::{
    parser, CheckResult, CheckerConfig, ParseError, ProgressFn, ProxyChecker, ProxyConfig,
};
use vpn_checker::web::{self, AliveEntry};

/// Checks vless/ss/vmess/trojan share links by driving each through a local
/// proxy engine and probing the tunnel with a real HTTP request
#[derive(Parser)]
#[command(name = "vpn-checker")]
#[command(about = "Checks vless/ss/vmess/trojan share links through a local proxy engine")]
struct Cli {
    /// File with share links, one per line; reads stdin when omitted
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(short, long, default_value_t = 5)]
    workers: usize,

    /// Timeout per check, in seconds
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,

    /// Print results as a JSON array instead of a table
    #[arg(long)]
    json: bool,

    /// Disable ANSI colors
    #[arg(long)]
    no_color: bool,

    /// Serve alive configs over HTTP on this address after the run
    /// (e.g. 127.0.0.1:8080)
    #[arg(long)]
    serve: Option<String>,

    /// Proxy engine binary to drive
    #[arg(long, default_value = "xray")]
    engine_bin: String,
}

/// A raw input line paired with its parsed form, so alive results can be
/// republished with their original URI text.
struct ConfigEntry {
    raw_uri: String,
    config: ProxyConfig,
}

/// ANSI palette scoped to one run; `--no-color` swaps in the empty palette
/// instead of mutating any global state.
#[derive(Clone)]
struct Palette {
    reset: &'static str,
    green: &'static str,
    red: &'static str,
    yellow: &'static str,
    cyan: &'static str,
    gray: &'static str,
    bold: &'static str,
}

impl Palette {
    fn new(enabled: bool) -> Self {
        if enabled {
            Self {
                reset: "\x1b[0m",
                green: "\x1b[32m",
                red: "\x1b[31m",
                yellow: "\x1b[33m",
                cyan: "\x1b[36m",
                gray: "\x1b[90m",
                bold: "\x1b[1m",
            }
        } else {
            Self {
                reset: "",
                green: "",
                red: "",
                yellow: "",
                cyan: "",
                gray: "",
                bold: "",
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let palette = Palette::new(!cli.no_color);

    let entries = read_entries(cli.file.as_ref())?;
    if entries.is_empty() {
        bail!("no valid configs found");
    }

    let configs: Vec<ProxyConfig> = entries.iter().map(|e| e.config.clone()).collect();
    let total = configs.len();

    eprintln!(
        "{}{}vpn-checker{} — {} configs, {} workers, timeout {}s",
        palette.bold, palette.cyan, palette.reset, total, cli.workers, cli.timeout
    );

    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let alive_count = Arc::new(AtomicUsize::new(0));
    let on_result: Arc<ProgressFn> = {
        let bar = bar.clone();
        let palette = palette.clone();
        let alive_count = Arc::clone(&alive_count);
        Arc::new(move |result, _completed, _total| {
            if result.alive {
                alive_count.fetch_add(1, Ordering::Relaxed);
            }
            bar.println(progress_line(result, &palette));
            bar.inc(1);
        })
    };

    let checker = ProxyChecker::with_config(
        CheckerConfig::new()
            .with_workers(cli.workers)
            .with_timeout(Duration::from_secs(cli.timeout))
            .with_engine_bin(cli.engine_bin.clone()),
    );

    let started = Instant::now();
    let results = checker.check_all(configs, Some(on_result)).await;
    bar.finish_and_clear();

    let alive = alive_count.load(Ordering::Relaxed);
    eprintln!(
        "{}Done in {:.1?}{}  Total: {}  {}✔ Alive: {}{}  {}✘ Dead: {}{}\n",
        palette.bold,
        started.elapsed(),
        palette.reset,
        total,
        palette.green,
        alive,
        palette.reset,
        palette.red,
        total - alive,
        palette.reset,
    );

    if cli.json {
        print_json(&results)?;
    } else {
        print_table(&results, &palette);
    }

    if let Some(addr) = cli.serve {
        let alive_entries = collect_alive_entries(&results, &entries);
        if alive_entries.is_empty() {
            eprintln!("no alive configs to serve");
            return Ok(());
        }
        eprintln!(
            "{}Serving {} alive configs:{}\n  http://{}/\n  http://{}/configs",
            palette.cyan,
            alive_entries.len(),
            palette.reset,
            addr,
            addr
        );
        web::serve(&addr, alive_entries).await?;
    }

    Ok(())
}

/// Read share links from `path` or stdin. Blank, comment and unparseable
/// lines are skipped; only the unparseable ones are worth a debug note.
fn read_entries(path: Option<&PathBuf>) -> Result<Vec<ConfigEntry>> {
    let reader: Box<dyn BufRead> = match path {
        Some(p) => Box::new(BufReader::new(
            File::open(p).with_context(|| format!("cannot open {}", p.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line.context("read input")?;
        match parser::parse(&line) {
            Ok(config) => entries.push(ConfigEntry {
                raw_uri: line.trim().to_string(),
                config,
            }),
            Err(ParseError::EmptyOrComment) => {}
            Err(err) => log::debug!("skipping line: {err}"),
        }
    }
    Ok(entries)
}

fn progress_line(result: &CheckResult, palette: &Palette) -> String {
    if result.alive {
        let latency_ms = result.latency.map(|d| d.as_millis()).unwrap_or_default();
        format!(
            "{}✔{} {:<30} {}{:<12}{} {}{:>5}ms{}  {} → {}",
            palette.green,
            palette.reset,
            truncate(&result.name, 30),
            palette.gray,
            result.protocol,
            palette.reset,
            palette.yellow,
            latency_ms,
            palette.reset,
            result.exit_ip.as_deref().unwrap_or("-"),
            result.country.as_deref().unwrap_or("-"),
        )
    } else {
        format!(
            "{}✘{} {:<30} {}{:<12}{} {}{}{}",
            palette.red,
            palette.reset,
            truncate(&result.name, 30),
            palette.gray,
            result.protocol,
            palette.reset,
            palette.red,
            truncate(result.error.as_deref().unwrap_or(""), 60),
            palette.reset,
        )
    }
}

fn print_table(results: &[CheckResult], palette: &Palette) {
    let sep = "─".repeat(120);
    println!(
        "{}{:<3} │ {:<30} │ {:<12} │ {:<22} │ {:<8} │ {:<9} │ {:<16} │ {}{}",
        palette.bold, "#", "NAME", "PROTO", "SERVER", "STATUS", "LATENCY", "EXIT IP", "COUNTRY", palette.reset
    );
    println!("{sep}");

    for result in results {
        let (status, latency, exit_ip, country) = if result.alive {
            (
                format!("{}✔ OK  {}", palette.green, palette.reset),
                format!(
                    "{}ms",
                    result.latency.map(|d| d.as_millis()).unwrap_or_default()
                ),
                result.exit_ip.as_deref().unwrap_or("-").to_string(),
                result.country.as_deref().unwrap_or("-").to_string(),
            )
        } else {
            (
                format!("{}✘ FAIL{}", palette.red, palette.reset),
                "-".to_string(),
                "-".to_string(),
                "-".to_string(),
            )
        };

        println!(
            "{:<3} │ {:<30} │ {:<12} │ {:<22} │ {} │ {:<9} │ {:<16} │ {}",
            result.index,
            truncate(&result.name, 30),
            result.protocol,
            truncate(&result.endpoint(), 22),
            status,
            latency,
            exit_ip,
            country,
        );

        if let Some(error) = &result.error {
            println!(
                "    │ {}error: {}{}",
                palette.red,
                truncate(error, 100),
                palette.reset
            );
        }
    }

    println!("{sep}");
    let alive = results.iter().filter(|r| r.alive).count();
    println!(
        "{}Total: {}  Alive: {}{}  Dead: {}",
        palette.bold,
        results.len(),
        alive,
        palette.reset,
        results.len() - alive,
    );
}

#[derive(Serialize)]
struct JsonResult<'a> {
    index: usize,
    name: &'a str,
    protocol: &'a str,
    server: &'a str,
    port: u16,
    alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_ip: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn print_json(results: &[CheckResult]) -> Result<()> {
    let out: Vec<JsonResult> = results
        .iter()
        .map(|r| JsonResult {
            index: r.index,
            name: &r.name,
            protocol: r.protocol,
            server: &r.server,
            port: r.port,
            alive: r.alive,
            latency_ms: r.latency.map(|d| d.as_millis()),
            exit_ip: r.exit_ip.as_deref(),
            country: r.country.as_deref(),
            error: r.error.as_deref(),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Pair each alive result with the raw URI it was parsed from
fn collect_alive_entries(results: &[CheckResult], entries: &[ConfigEntry]) -> Vec<AliveEntry> {
    results
        .iter()
        .filter(|r| r.alive)
        .filter_map(|r| {
            entries.get(r.index - 1).map(|entry| AliveEntry {
                result: r.clone(),
                raw_uri: entry.raw_uri.clone(),
            })
        })
        .collect()
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
