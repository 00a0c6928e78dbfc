use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, ValueEnum};
use serde::Serialize;
use statusha_api::{Aggregator, AggregatorConfig, ServiceOwnership, ServiceStatuses, StatusApi, StatusResult};
use statusha_store::InMemoryCluster;
use tracing::{error, info, warn};

const DEFAULT_TIMEOUT_MS: u64 = 25_000;

#[derive(Parser, Debug)]
#[command(name = "statusha", version, about = "Report the HA status of partitioned cache services")]
struct Cli {
    /// Timeout in milliseconds; unparseable values fall back to the default (25000)
    timeout_ms: Option<String>,

    /// Cluster topology file (YAML or JSON)
    #[arg(long = "cluster", env = "STATUSHA_CLUSTER")]
    cluster: PathBuf,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
    output: Output,

    /// Also report primary partitions owned per process
    #[arg(long = "ownership", action = ArgAction::SetTrue)]
    ownership: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

fn init_tracing() {
    let env = std::env::var("STATUSHA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STATUSHA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STATUSHA_METRICS_ADDR; expected host:port");
        }
    }
}

fn resolve_timeout(arg: Option<&str>) -> Duration {
    let ms = match arg {
        None => DEFAULT_TIMEOUT_MS,
        Some(s) => match s.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => ms,
            _ => {
                warn!(value = %s, "using default timeout {}", DEFAULT_TIMEOUT_MS);
                DEFAULT_TIMEOUT_MS
            }
        },
    };
    Duration::from_millis(ms)
}

#[derive(Debug, Serialize)]
struct Report {
    taken_at: String,
    timeout_ms: u64,
    services: ServiceStatuses,
    #[serde(skip_serializing_if = "Option::is_none")]
    ownership: Option<ServiceOwnership>,
}

async fn collect(api: &dyn StatusApi, timeout: Duration, with_ownership: bool) -> StatusResult<Report> {
    let services = api.statuses(Some(timeout)).await?;
    let ownership = if with_ownership { Some(api.ownership(Some(timeout)).await?) } else { None };
    Ok(Report {
        taken_at: chrono::Local::now().to_rfc3339(),
        timeout_ms: timeout.as_millis() as u64,
        services,
        ownership,
    })
}

fn render_human(report: &Report) -> String {
    let mut out = String::new();
    for (name, status) in report.services.iter() {
        out.push_str(&format!("ServiceName: {}, Status: {}\n", name, status));
        if let Some(owned) = report.ownership.as_ref().and_then(|o| o.get(name)) {
            for (pid, count) in owned {
                let who = if *pid < 0 { "unowned".to_string() } else { format!("pid {}", pid) };
                out.push_str(&format!("  {:<12} {} partitions\n", who, count));
            }
        }
    }
    out
}

async fn run(cli: Cli) -> Result<()> {
    init_metrics();
    let timeout = resolve_timeout(cli.timeout_ms.as_deref());
    info!(cluster = %cli.cluster.display(), timeout_ms = %timeout.as_millis(), "statusha invoked");
    let cluster = Arc::new(InMemoryCluster::from_path(&cli.cluster)?);
    let agg = Aggregator::new(cluster, AggregatorConfig::from_env());
    match collect(&agg, timeout, cli.ownership).await {
        Ok(report) => {
            if report.services.is_empty() {
                info!("no partitioned services reported");
            }
            match cli.output {
                Output::Human => print!("{}", render_human(&report)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Err(e) => {
            error!(error = ?e, "retrieving service status failed");
            eprintln!("error retrieving the distributed cache services: {}", e);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let res = rt.block_on(run(cli));
    // Timed-out scans are left running; do not wait for them on exit.
    rt.shutdown_timeout(Duration::from_millis(100));
    if let Err(e) = &res {
        error!(error = ?e, "statusha failed");
        eprintln!("error: {:#}", e);
    }
    Ok(())
}
