use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dhcpload::config::{LoadConfig, LoggingConfig};
use dhcpload::sim::SimConfig;
use dhcpload::RunSummary;

#[derive(Parser)]
#[command(
    name = "dhcpload",
    about = "Synthetic DHCPv4 load generator",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate load until interrupted (Ctrl-C) or --duration elapses
    Run(RunArgs),

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Args)]
struct RunArgs {
    /// Number of concurrent workers
    #[arg(long)]
    workers: Option<usize>,

    /// Transaction starts per second, across all workers
    #[arg(long)]
    rate: Option<f64>,

    /// Starts admitted back to back
    #[arg(long)]
    burst: Option<u32>,

    /// End-to-end transaction deadline in milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Interface to pin sockets to (Linux only)
    #[arg(long)]
    interface: Option<String>,

    /// Server address DHCP messages are sent to
    #[arg(long)]
    server: Option<SocketAddr>,

    /// Address for the Prometheus /metrics endpoint
    #[arg(long)]
    metrics_listen: Option<SocketAddr>,

    /// Do not serve /metrics
    #[arg(long)]
    no_metrics: bool,

    /// Do not RELEASE leases after the ACK
    #[arg(long)]
    no_release: bool,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Answer every worker from an in-process simulated server
    #[arg(long)]
    simulate: bool,

    /// JSON output (logs and summary)
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut LoadConfig) {
        if let Some(n) = self.workers {
            config.engine.workers = n;
        }
        if let Some(r) = self.rate {
            config.rate.per_second = r;
        }
        if let Some(b) = self.burst {
            config.rate.burst = b;
        }
        if let Some(d) = self.deadline_ms {
            config.session.deadline_ms = d;
        }
        if let Some(iface) = &self.interface {
            config.transport.interface = Some(iface.clone());
        }
        if let Some(server) = self.server {
            config.transport.server_address = server;
        }
        if let Some(addr) = self.metrics_listen {
            config.metrics.listen_address = addr;
        }
        if self.no_metrics {
            config.metrics.enabled = false;
        }
        if self.no_release {
            config.session.send_release = false;
        }
        if self.json {
            config.logging.json = true;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Plain stderr logger for the config lookup, which runs before the
/// configured subscriber can be installed.
fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        LoadConfig::load_or_default(cli.config.as_deref())
    })?;

    match cli.command {
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run(args) => {
            args.apply(&mut config);
            init_tracing(&config.logging);
            tracing::info!(config_path = ?cli.config, simulate = args.simulate, "starting dhcpload");

            let cancel = CancellationToken::new();

            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, finishing in-flight transactions");
                    on_signal.cancel();
                }
            });

            if let Some(secs) = args.duration {
                let on_timer = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    on_timer.cancel();
                });
            }

            let summary = if args.simulate {
                dhcpload::run_simulated(config, SimConfig::default(), cancel).await?
            } else {
                dhcpload::run(config, cancel).await?
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let report = &summary.report;
    let m = &summary.metrics;
    let ms = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v));

    println!("\n=== dhcpload run {} ===", report.run_id);
    println!("Started:  {}", report.started_at.to_rfc3339());
    println!("Duration: {:.1}s", report.duration_secs);
    println!(
        "Workers:  {} ran, {} failed",
        report.workers_started, report.workers_failed
    );
    println!();
    println!("{:<22} | {:>10}", "Counter", "Value");
    println!("{:-<22}-|-{:->10}", "", "");
    println!("{:<22} | {:>10}", "DISCOVER sent", m.discovers_sent);
    println!("{:<22} | {:>10}", "REQUEST sent", m.requests_sent);
    println!("{:<22} | {:>10}", "RELEASE sent", m.releases_sent);
    println!("{:<22} | {:>10}", "RELEASE failed", m.release_failures);
    println!("{:<22} | {:>10}", "Succeeded", m.succeeded);
    println!("{:<22} | {:>10}", "Timed out", m.timeouts);
    println!("{:<22} | {:>10}", "Protocol mismatch", m.protocol_mismatches);
    println!("{:<22} | {:>10}", "Transport error", m.transport_errors);
    println!("{:<22} | {:>10}", "Random source error", m.random_source_errors);
    println!();
    println!("{:<22} | {:>10} | {:>10}", "Latency", "Samples", "Mean (ms)");
    println!("{:-<22}-|-{:->10}-|-{:->10}", "", "", "");
    println!(
        "{:<22} | {:>10} | {:>10}",
        "DISCOVER -> OFFER",
        m.discover_offer_samples,
        ms(m.discover_offer_mean_ms)
    );
    println!(
        "{:<22} | {:>10} | {:>10}",
        "REQUEST -> ACK",
        m.request_ack_samples,
        ms(m.request_ack_mean_ms)
    );
    println!();
}
