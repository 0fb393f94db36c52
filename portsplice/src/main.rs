// portsplice/src/main.rs
//
// portsplice daemon: load a JSON rules file, install the rules, splice
// until interrupted.
//
// Usage:
//   portsplice --config /etc/portsplice/rules.json
//   portsplice --config rules.json --cert-dir ./certs --threads 8
//
// Log verbosity follows RUST_LOG (e.g. RUST_LOG=portsplice=debug).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use portsplice::{FileConfig, ProxyEngine};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "portsplice",
    about   = "User-space L4/L7 socket proxy with TLS termination and host routing",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Rules file (JSON)
    #[arg(long, default_value = "/etc/portsplice/rules.json")]
    config: PathBuf,

    /// Override the certificate directory
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// Override the CA directory
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Worker threads (defaults to the rules file, then 4)
    #[arg(long)]
    threads: Option<usize>,

    /// Seconds between stats lines; 0 disables
    #[arg(long, default_value = "30")]
    stats_interval: u64,
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("portsplice=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;
    let file: FileConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", cli.config.display()))?;

    let threads = cli.threads.unwrap_or(file.threads).max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(run(cli, file))
}

async fn run(cli: Cli, file: FileConfig) -> Result<()> {
    let mut cfg = file.engine_config();
    if let Some(dir) = cli.cert_dir {
        cfg.cert_dir = dir;
    }
    if let Some(dir) = cli.ca_dir {
        cfg.ca_dir = Some(dir);
    }

    let engine = ProxyEngine::new(cfg, None);

    let mut installed = 0usize;
    for rule in &file.rules {
        match engine.add_rule(rule.key(), rule.spec()) {
            Ok(()) => installed += 1,
            Err(e) => error!("rule {} rejected: {e}", rule.key()),
        }
    }
    info!("portsplice up, {installed}/{} rule(s) installed", file.rules.len());

    if cli.stats_interval > 0 {
        tokio::spawn(stats_loop(engine.clone(), cli.stats_interval));
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    engine.stop();
    Ok(())
}

async fn stats_loop(engine: Arc<ProxyEngine>, every: u64) {
    loop {
        tokio::time::sleep(Duration::from_secs(every)).await;
        let (rules, flows) = engine.summary();
        info!("stats rules={rules} flows={flows}");
    }
}
