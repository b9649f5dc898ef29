use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use nmap_session_rs::logging::{self, LogConfig, LogFormat};
use nmap_session_rs::scanner::NmapScanner;
use nmap_session_rs::session::{ScanOutcome, ScanRequest, ScanSession};
use nmap_session_rs::types::{HostResult, ScanResult};

use anyhow::{bail, Result};
use clap::Parser;

/// nmap-session-rs — run an nmap scan in the background and poll until it finishes.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "nmap-session-rs",
    version,
    about = "Run an nmap scan in the background and poll until its results are available.",
    long_about = None
)]
struct Cli {
    /// Host to scan.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port specification in nmap syntax (e.g. 22,80,8000-8100). Defaults to nmap's own choice.
    #[arg(long)]
    ports: Option<String>,

    /// Flags passed verbatim to nmap.
    #[arg(long, default_value = "-sV -T4 -A", allow_hyphen_values = true)]
    arguments: String,

    /// Seconds between polls.
    #[arg(long = "poll-secs", default_value_t = 3)]
    poll_secs: u64,

    /// Write the parsed result as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Path to the nmap binary.
    #[arg(long = "nmap-path", env = "NMAP_PATH", default_value = "nmap")]
    nmap_path: PathBuf,

    /// Default log filter; RUST_LOG overrides it.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Log output format: pretty, compact or json.
    #[arg(long = "log-format", default_value = "compact")]
    log_format: LogFormat,

    /// Include source file and line in log lines.
    #[arg(long = "log-source", default_value_t = false)]
    log_source: bool,

    /// Omit the module path from log lines.
    #[arg(long = "no-log-target", default_value_t = false)]
    no_log_target: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging_with_config(
        &LogConfig::new()
            .level(cli.log_level.clone())
            .format(cli.log_format)
            .with_file(cli.log_source)
            .with_target(!cli.no_log_target),
    )?;

    println!("nmap-session-rs configuration:");
    println!("  host         : {}", cli.host);
    println!("  ports        : {}", cli.ports.as_deref().unwrap_or("<nmap default>"));
    println!("  arguments    : {}", cli.arguments);
    println!("  poll_secs    : {}", cli.poll_secs);
    println!("  nmap         : {}", cli.nmap_path.display());

    let scanner = NmapScanner::new(&cli.nmap_path);
    match scanner.version().await {
        Ok(v) => tracing::info!(version = %v, "found nmap"),
        Err(e) => tracing::warn!(error = %e, "could not determine nmap version"),
    }

    let mut request = ScanRequest::new().arguments(cli.arguments.clone());
    if let Some(p) = &cli.ports {
        request = request.ports(p.clone());
    }

    let mut session = ScanSession::with_scanner(cli.host.clone(), scanner);
    let cb_host = cli.host.clone();
    session.scan(
        request,
        Some(Box::new(move |result: &ScanResult| {
            println!("From callback: {}", summarize(&cb_host, result.host(&cb_host)));
        })),
    )?;

    let poll = Duration::from_secs(cli.poll_secs.max(1));
    while !session.results_available() {
        println!("Waiting ...");
        tokio::time::sleep(poll).await;
    }

    let outcome = session.results();
    session.close().await?;

    match outcome {
        ScanOutcome::Success(result) => {
            println!("From results: {}", summarize(&cli.host, result.host(&cli.host)));
            if let Some(h) = result.host(&cli.host) {
                print_ports_table(h);
            }
            if let Some(path) = cli.output.as_deref() {
                if let Err(e) = write_result_json(path, &result) {
                    eprintln!("Failed to write JSON to {}: {}", path.display(), e);
                } else {
                    println!("Wrote JSON result to {}", path.display());
                }
            }
            Ok(())
        }
        ScanOutcome::Failure(e) => bail!("scan of {} failed: {e}", cli.host),
        ScanOutcome::Empty => bail!("scan of {} ended without a result", cli.host),
    }
}

fn summarize(host: &str, result: Option<&HostResult>) -> String {
    match result {
        Some(h) => format!(
            "{host} is {} with {} open port(s) of {} reported",
            if h.state.is_empty() { "unknown" } else { h.state.as_str() },
            h.open_ports().count(),
            h.ports.len()
        ),
        None => format!("{host} not present in scan output (host down or filtered?)"),
    }
}

fn print_ports_table(host: &HostResult) {
    let mut service_w = "service".len();
    for p in &host.ports {
        if let Some(s) = &p.service {
            service_w = service_w.max(describe_service(s).chars().count().min(60));
        }
    }
    let port_w = "port/proto".len();
    let state_w = "state".len().max(8);

    println!(
        "\n{:<port_w$}  {:<state_w$}  {:<service_w$}",
        "port/proto",
        "state",
        "service",
        port_w = port_w,
        state_w = state_w,
        service_w = service_w
    );
    println!(
        "{:-<port_w$}  {:-<state_w$}  {:-<service_w$}",
        "",
        "",
        "",
        port_w = port_w,
        state_w = state_w,
        service_w = service_w
    );
    for p in &host.ports {
        let svc = clip(
            &p.service.as_ref().map(describe_service).unwrap_or_default(),
            60,
        );
        println!(
            "{:<port_w$}  {:<state_w$}  {:<service_w$}",
            format!("{}/{}", p.port, p.protocol),
            p.state,
            svc,
            port_w = port_w,
            state_w = state_w,
            service_w = service_w
        );
    }
    for os in &host.os_matches {
        println!("OS guess: {} ({}%)", os.name, os.accuracy);
    }
}

fn describe_service(s: &nmap_session_rs::types::ServiceInfo) -> String {
    [s.name.as_str(), s.product.as_str(), s.version.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// First `max` characters of `s`; never splits a UTF-8 sequence.
fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn write_result_json(path: &std::path::Path, result: &ScanResult) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, result)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_respects_char_boundaries() {
        let product = format!("{}é Serveur", "a".repeat(59));
        let clipped = clip(&product, 60);
        assert_eq!(clipped.chars().count(), 60);
        assert!(clipped.ends_with('é'));
        assert_eq!(clip("ssh", 60), "ssh");
    }

    #[test]
    fn cli_log_flags() {
        let cli = Cli::parse_from(["nmap-session-rs", "--log-source", "--no-log-target"]);
        assert!(cli.log_source);
        assert!(cli.no_log_target);
        assert_eq!(cli.arguments, "-sV -T4 -A");
    }
}
