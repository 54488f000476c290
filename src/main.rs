use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use port_scan_rs::config::ServerConfig;
use port_scan_rs::events::ServerEvent;
use port_scan_rs::prober::TcpProber;
use port_scan_rs::registry::SessionRegistry;
use port_scan_rs::session::SessionSnapshot;
use port_scan_rs::types::{ScanConfig, Target};
use port_scan_rs::{export, ports, server};

/// port-scan-rs — resumable async TCP port scanner with a live event stream and CSV export.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "port-scan-rs",
    version,
    about = "Resumable async TCP port scanner with a live event stream and CSV export.",
    long_about = None
)]
struct Cli {
    /// Scan this IPv4 host in the terminal instead of starting the server.
    #[arg(long)]
    target: Option<String>,

    /// Port range for --target, e.g. 1-1024 or 80.
    #[arg(long, default_value = "1-1024")]
    ports: String,

    /// Max concurrent TCP connect attempts for --target (clamped to 1-500).
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    /// Socket connect timeout in milliseconds for --target.
    #[arg(long = "timeout-ms", default_value_t = 1000)]
    timeout_ms: u64,

    /// Write the CSV export of a --target scan to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Address the HTTP/WebSocket server listens on.
    #[arg(long, env = "PORTSCAN_BIND", default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// Directory with the static UI files.
    #[arg(long = "ui-dir", env = "PORTSCAN_UI_DIR", default_value = "ui")]
    ui_dir: PathBuf,

    /// Seconds a session stays exportable after its connection closes.
    #[arg(long = "retention-secs", env = "PORTSCAN_RETENTION_SECS", default_value_t = 600)]
    retention_secs: u64,

    /// Log level used when RUST_LOG is not set.
    #[arg(long = "log-level", env = "PORTSCAN_LOG", default_value = "info")]
    log_level: String,
}

const CLI_SESSION: &str = "cli";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.target.as_deref() {
        Some(host) => run_headless(&cli, host).await,
        None => {
            let config = ServerConfig {
                bind: cli.bind,
                ui_dir: cli.ui_dir.clone(),
                ..ServerConfig::default()
            }
            .with_retention(Duration::from_secs(cli.retention_secs));
            tracing::info!(?config, "starting server");
            tokio::select! {
                res = server::spawn_server(config) => res,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    Ok(())
                }
            }
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("port_scan_rs={default_level},tower_http={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run one scan session in the terminal. Ctrl+C stops it.
async fn run_headless(cli: &Cli, host: &str) -> Result<()> {
    let (start, end) = ports::parse_port_range(&cli.ports)?;
    let target = Target::parse(host, i64::from(start), i64::from(end))?;
    let config = ScanConfig::from_request(
        concurrency_arg(cli.concurrency),
        cli.timeout_ms as f64 / 1000.0,
    )?;

    println!("port-scan-rs configuration:");
    println!("  target       : {}", target.host);
    println!("  ports        : {}-{}", target.start_port, target.end_port);
    println!("  concurrency  : {}", config.concurrency);
    println!("  timeout_ms   : {}", config.timeout.as_millis());
    println!(
        "  output       : {}",
        cli.output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );

    let registry = SessionRegistry::new(Arc::new(TcpProber), Duration::from_secs(cli.retention_secs));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = registry.get_or_create(CLI_SESSION, tx).await;
    session.start(target, config)?;

    let mut stopping = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    if print_event(&event) {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                println!("\nStopping, waiting for in-flight probes...");
                if let Err(e) = session.stop() {
                    eprintln!("stop failed: {e}");
                }
            }
        }
    }

    print_results_table(&session.snapshot());

    if let Some(path) = cli.output.as_deref() {
        match write_results_csv(path, &export::export_session(&session)?) {
            Ok(()) => println!("Wrote CSV results to {}", path.display()),
            Err(e) => eprintln!("Failed to write CSV to {}: {e:#}", path.display()),
        }
    }
    Ok(())
}

/// Widen `--concurrency` for validation; oversized values saturate and are
/// clamped to the maximum later.
fn concurrency_arg(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Print one event; returns true once the run has ended.
fn print_event(event: &ServerEvent) -> bool {
    match event {
        ServerEvent::ScanStarted { message, .. } => println!("\n{message}"),
        ServerEvent::PortFound { port, service, .. } => println!("  open: {port:>5}  {service}"),
        ServerEvent::ScanProgress { progress, scanned, total, open_count } => {
            if progress % 10 == 0 || scanned == total {
                println!("  progress: {progress:>3}% ({scanned}/{total}, {open_count} open)");
            }
        }
        ServerEvent::ScanComplete(summary) => {
            println!("{} ({} ports, {} open)", summary.message, summary.total_ports, summary.open_count);
            return true;
        }
        ServerEvent::ScanStopped { message, can_resume } => {
            println!("{message} (resumable: {can_resume})");
            return true;
        }
        ServerEvent::ScanError { message, .. } => {
            eprintln!("scan error: {message}");
            return true;
        }
        ServerEvent::Connected { .. } => {}
    }
    false
}

fn print_results_table(snapshot: &SessionSnapshot) {
    let port_w = 5usize;
    let mut service_w = "service".len();
    for r in &snapshot.open_results {
        service_w = service_w.max(r.service.len());
    }

    println!(
        "\nOpen ports: {} (scanned: {}/{})",
        snapshot.open_count, snapshot.scanned, snapshot.total
    );
    println!(
        "{:>port_w$}  {:<service_w$}  {}",
        "port",
        "service",
        "status",
        port_w = port_w,
        service_w = service_w
    );
    println!(
        "{:-<port_w$}  {:-<service_w$}  {:-<6}",
        "",
        "",
        "",
        port_w = port_w,
        service_w = service_w
    );
    for r in &snapshot.open_results {
        println!(
            "{:>port_w$}  {:<service_w$}  {}",
            r.port,
            r.service,
            "open",
            port_w = port_w,
            service_w = service_w
        );
    }
}

fn write_results_csv(path: &Path, csv: &[u8]) -> Result<()> {
    std::fs::write(path, csv).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
