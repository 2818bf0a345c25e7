use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use lookout_api::{DashboardApi, EngineApi, LogBatch, WatchUpdate};
use lookout_core::{ResourceChange, ResourceSnapshot, SourceAdapter};
use lookout_dockhub::DockerAdapter;
use lookout_engine::{EngineConfig, NotificationEngine};
use lookout_kubehub::{KubeAdapter, KubeConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "lookoutctl", version, about = "Lookout CLI: follow resources across sources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    kube: KubeArgs,

    /// Follow containers of the local Docker daemon
    #[arg(long = "docker", global = true, env = "LOOKOUT_DOCKER")]
    docker: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct KubeArgs {
    /// Kubernetes namespace to follow
    #[arg(long = "ns", global = true, env = "LOOKOUT_K8S_NAMESPACE", default_value = "default")]
    namespace: String,

    /// `;`-separated service names; pods are matched by `app=<service>`
    #[arg(long = "services", global = true, env = "LOOKOUT_K8S_SERVICES")]
    services: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print application name and version
    Info,
    /// Print current resources, then follow changes until Ctrl-C
    Watch,
    /// Follow the log of one resource
    Logs {
        /// Resource name, e.g. "web"
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("LOOKOUT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LOOKOUT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LOOKOUT_METRICS_ADDR; expected host:port");
        }
    }
}

/// An unreachable source is skipped so the others still run.
async fn connect_or_skip<A, F>(kind: &str, connect: F) -> Option<Arc<dyn SourceAdapter>>
where
    A: SourceAdapter + 'static,
    F: Future<Output = Result<A>>,
{
    match connect.await {
        Ok(adapter) => Some(Arc::new(adapter)),
        Err(e) => {
            warn!(source = %kind, error = %format!("{e:#}"), "source unavailable; continuing without it");
            None
        }
    }
}

async fn build_sources(cli: &Cli) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let mut sources: Vec<Arc<dyn SourceAdapter>> = Vec::new();
    if let Some(raw) = cli.kube.services.as_deref() {
        let cfg = KubeConfig::new(cli.kube.namespace.clone(), raw).context("invalid Kubernetes service list")?;
        info!(ns = %cfg.namespace, services = ?cfg.services, "kubernetes source configured");
        sources.extend(connect_or_skip("kubernetes", KubeAdapter::connect(cfg)).await);
    }
    if cli.docker {
        sources.extend(connect_or_skip("docker", async { DockerAdapter::connect() }).await);
    }
    Ok(sources)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                cancel.cancel();
            }
        }
    });

    let sources = build_sources(&cli).await?;
    if sources.is_empty() && !matches!(cli.command, Commands::Info) {
        warn!("no sources available; set --services or --docker");
    }
    let engine = Arc::new(NotificationEngine::start(sources, EngineConfig::from_env(), cancel.clone()).await);
    let api = EngineApi::new(Arc::clone(&engine));

    let outcome: Result<()> = match cli.command {
        Commands::Info => {
            let info = api.application_information().await?;
            match cli.output {
                Output::Human => println!("{} {}", info.application_name, info.application_version),
                Output::Json => println!("{}", serde_json::to_string_pretty(&info)?),
            }
            Ok(())
        }
        Commands::Watch => {
            let mut updates = api.watch_resources().await?;
            let mut failure = None;
            while let Some(update) = updates.next().await {
                match update {
                    Ok(update) => match cli.output {
                        Output::Human => {
                            for line in render_update(&update, Utc::now()) {
                                println!("{line}");
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string(&update)?),
                    },
                    Err(e) => {
                        error!(error = %e, "watch aborted");
                        failure = Some(e);
                    }
                }
            }
            failure.map_or(Ok(()), |e| Err(e.into()))
        }
        Commands::Logs { name } => {
            info!(name = %name, "logs invoked");
            let mut batches = api.watch_resource_logs(&name).await?;
            while let Some(batch) = batches.next().await {
                match cli.output {
                    Output::Human => {
                        for line in render_logs(&batch) {
                            println!("{line}");
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string(&batch)?),
                }
            }
            Ok(())
        }
    };

    engine.shutdown();
    engine.closed().await;
    outcome
}

fn render_update(update: &WatchUpdate, now: DateTime<Utc>) -> Vec<String> {
    match update {
        WatchUpdate::InitialData(items) => {
            let mut out = vec![format!("{:<24} {:<14} {:<12} {:>4} {}", "NAME", "TYPE", "STATE", "AGE", "VERSION")];
            out.extend(items.iter().map(|s| render_row(s, now)));
            out
        }
        WatchUpdate::Changes(changes) => changes
            .iter()
            .map(|c| match c {
                ResourceChange::Upsert(s) => format!("~ {}", render_row(s, now)),
                ResourceChange::Delete { name, version } => format!("- {:<22} (v{})", name, version),
            })
            .collect(),
    }
}

fn render_row(s: &ResourceSnapshot, now: DateTime<Utc>) -> String {
    let state = if s.state_text().is_empty() { "-" } else { s.state_text() };
    format!("{:<24} {:<14} {:<12} {:>4} v{}", s.name, s.resource_type.as_str(), state, render_age(s.creation_time, now), s.version)
}

fn render_logs(batch: &LogBatch) -> Vec<String> {
    batch
        .lines
        .iter()
        .map(|l| if l.is_stderr { format!("{:>6} ! {}", l.line_number, l.text) } else { format!("{:>6}   {}", l.line_number, l.text) })
        .collect()
}

fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (now - created).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
