#![deny(unsafe_code)]

//! loopbridge CLI — command-line control plane.
//!
//! `start` runs the privileged daemon in the foreground; the other
//! commands talk to it over the control socket. A connection's resources
//! are rolled back by the daemon when the connection drops, so `redirect`
//! holds its connection open until Ctrl-C.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use loopbridge_config::AppConfig;
use loopbridge_core::daemon::ShutdownSignal;
use loopbridge_core::elevation::{ElevationRequest, PortTargetType};
use loopbridge_core::ipc::client::ClientError;
use loopbridge_core::ipc::types::{
    EndpointDescriptor, HostsEntrySpec, ProcessTarget, ServiceTarget,
};
use loopbridge_core::logging::RotatingLog;
use loopbridge_core::{Daemon, DaemonClient};

/// loopbridge — redirect local traffic to a remote cluster workload.
#[derive(Parser)]
#[command(name = "loopbridge", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "loopbridge.toml")]
    config: PathBuf,

    /// Directory for rotating log files (overrides the config file).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground. Needs elevation for real use.
    Start,

    /// Report whether a daemon is reachable on the control socket.
    Status,

    /// Redirect endpoints onto loopback addresses and hold until Ctrl-C.
    ///
    /// Allocates an address per endpoint, publishes hosts entries for
    /// them, and keeps the session open; everything is rolled back when
    /// the command exits.
    Redirect {
        /// Endpoints as `name` or `name:namespace`.
        #[arg(required = true)]
        endpoints: Vec<String>,

        /// Workload namespace recorded with the hosts entries.
        #[arg(long, default_value = "default")]
        namespace: String,
    },

    /// Free ports held by user processes (`pid:port` pairs).
    FreePort {
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Stop OS services holding ports (`unit:port` pairs).
    DisableService {
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

/// File-logging plumbing kept alive for the process lifetime.
struct FileLogging {
    writer: loopbridge_core::logging::LogWriter,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    task: tokio::task::JoinHandle<()>,
}

impl FileLogging {
    async fn finish(self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
        let _ = self.task.await;
        let _ = self.writer.flush_now();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let file_logging = init_tracing(&cli, &config)?;

    let result = match &cli.command {
        Commands::Start => cmd_start(config.clone()).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Redirect {
            endpoints,
            namespace,
        } => cmd_redirect(&config, endpoints, namespace).await,
        Commands::FreePort { targets } => cmd_free_port(&config, targets).await,
        Commands::DisableService { targets } => cmd_disable_service(&config, targets).await,
        Commands::Config { show } => cmd_config(&cli.config, &config, *show),
    };

    if let Some(logging) = file_logging {
        logging.finish().await;
    }
    result
}

fn init_tracing(cli: &Cli, config: &AppConfig) -> Result<Option<FileLogging>> {
    let default_level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| config.logging.dir.as_deref().map(PathBuf::from));

    let (file_layer, file_logging) = match log_dir {
        Some(dir) => {
            let (rotating, writer) = RotatingLog::open(
                &dir,
                Duration::from_secs(config.logging.rotate_secs),
                Duration::from_secs(config.logging.flush_secs),
                config.logging.max_files,
            )
            .with_context(|| format!("failed to open log directory {}", dir.display()))?;

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let task = tokio::spawn(rotating.run(shutdown_rx));
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer.clone())
                        .with_ansi(false),
                ),
                Some(FileLogging {
                    writer,
                    shutdown_tx,
                    task,
                }),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(file_logging)
}

async fn cmd_start(config: AppConfig) -> Result<()> {
    info!("starting loopbridge daemon");
    let daemon = Daemon::new(config).map_err(|e| anyhow::anyhow!(e))?;
    daemon.run().await.map_err(|e| anyhow::anyhow!(e))
}

async fn cmd_status(config: &AppConfig) -> Result<()> {
    let mut client = DaemonClient::new(&config.daemon.socket_path);
    if !client.daemon_available() {
        bail!(
            "daemon is not running (socket not found at {})",
            config.daemon.socket_path
        );
    }
    client
        .connect()
        .await
        .map_err(render_client_error)
        .context("daemon socket exists but is not answering")?;
    client.close().await;
    println!("daemon reachable at {}", config.daemon.socket_path);
    Ok(())
}

async fn cmd_redirect(config: &AppConfig, endpoints: &[String], namespace: &str) -> Result<()> {
    let descriptors = endpoints
        .iter()
        .map(|raw| parse_endpoint(raw))
        .collect::<Result<Vec<_>>>()?;

    let mut client = DaemonClient::new(&config.daemon.socket_path);
    let allocations = client
        .allocate_ip(descriptors)
        .await
        .map_err(render_client_error)?;

    let entries: Vec<HostsEntrySpec> = allocations
        .iter()
        .map(|alloc| HostsEntrySpec {
            ip: alloc.ip,
            hostnames: hostnames_for(&alloc.endpoint),
        })
        .collect();
    client
        .add_hosts_entries(namespace, entries)
        .await
        .map_err(render_client_error)?;

    for alloc in &allocations {
        println!("{}  ->  {}", alloc.endpoint, alloc.ip);
    }
    println!("redirect active; press Ctrl-C to release");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    info!("releasing redirect session");
    client.close().await;
    Ok(())
}

async fn cmd_free_port(config: &AppConfig, targets: &[String]) -> Result<()> {
    let targets = targets
        .iter()
        .map(|raw| parse_pid_port(raw))
        .collect::<Result<Vec<_>>>()?;

    let mut client = DaemonClient::new(&config.daemon.socket_path);
    let outcomes = client
        .kill_process(targets)
        .await
        .map_err(render_client_error)?;
    client.close().await;
    report_outcomes(&outcomes)
}

async fn cmd_disable_service(config: &AppConfig, targets: &[String]) -> Result<()> {
    let targets = targets
        .iter()
        .map(|raw| parse_service_port(raw))
        .collect::<Result<Vec<_>>>()?;

    let mut client = DaemonClient::new(&config.daemon.socket_path);
    let outcomes = client
        .disable_service(targets)
        .await
        .map_err(render_client_error)?;
    client.close().await;
    report_outcomes(&outcomes)
}

fn cmd_config(path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", path.display());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path).await.map_err(|e| anyhow::anyhow!(e))
    } else {
        Ok(AppConfig::default())
    }
}

fn report_outcomes(outcomes: &[loopbridge_core::ipc::types::TargetOutcome]) -> Result<()> {
    let mut failures = 0;
    for outcome in outcomes {
        let status = if outcome.succeeded { "ok" } else { "FAILED" };
        let detail = outcome.detail.as_deref().unwrap_or("");
        println!("port {:>5}  {status}  {detail}", outcome.port);
        if !outcome.succeeded {
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{failures} of {} targets failed", outcomes.len());
    }
    Ok(())
}

/// Turn a client error into the human-readable summary the user sees.
fn render_client_error(err: ClientError) -> anyhow::Error {
    match err {
        ClientError::ElevationRequired(Some(ElevationRequest::FreePort {
            ports,
            target_type,
        })) => {
            let holder = match target_type {
                PortTargetType::Process => "a process",
                PortTargetType::Service => "an OS service",
            };
            let ports = ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            anyhow::anyhow!(
                "freeing port(s) {ports} held by {holder} needs elevated privileges; \
                 restart the daemon elevated and retry"
            )
        }
        ClientError::ElevationRequired(Some(ElevationRequest::EditHostsFile)) => {
            anyhow::anyhow!(
                "editing the hosts file needs elevated privileges; \
                 restart the daemon elevated and retry"
            )
        }
        ClientError::ElevationRequired(None) => {
            anyhow::anyhow!(
                "this operation needs an elevated daemon; restart the daemon elevated and retry"
            )
        }
        other => anyhow::anyhow!(other),
    }
}

fn hostnames_for(endpoint: &EndpointDescriptor) -> Vec<String> {
    match &endpoint.namespace {
        Some(ns) => vec![endpoint.name.clone(), format!("{}.{ns}", endpoint.name)],
        None => vec![endpoint.name.clone()],
    }
}

fn parse_endpoint(raw: &str) -> Result<EndpointDescriptor> {
    if raw.is_empty() {
        bail!("endpoint must not be empty");
    }
    Ok(match raw.split_once(':') {
        Some((name, namespace)) if !name.is_empty() && !namespace.is_empty() => {
            EndpointDescriptor::service(name, namespace)
        }
        Some(_) => bail!("invalid endpoint {raw:?}, expected name or name:namespace"),
        None => EndpointDescriptor::external(raw),
    })
}

fn parse_pid_port(raw: &str) -> Result<ProcessTarget> {
    let (pid, port) = raw
        .split_once(':')
        .with_context(|| format!("invalid target {raw:?}, expected pid:port"))?;
    Ok(ProcessTarget {
        pid: pid
            .parse()
            .with_context(|| format!("invalid pid in {raw:?}"))?,
        port: port
            .parse()
            .with_context(|| format!("invalid port in {raw:?}"))?,
    })
}

fn parse_service_port(raw: &str) -> Result<ServiceTarget> {
    let (service, port) = raw
        .rsplit_once(':')
        .with_context(|| format!("invalid target {raw:?}, expected unit:port"))?;
    if service.is_empty() {
        bail!("invalid target {raw:?}, service name is empty");
    }
    Ok(ServiceTarget {
        service: service.to_string(),
        port: port
            .parse()
            .with_context(|| format!("invalid port in {raw:?}"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_endpoint_with_namespace() {
        let ep = parse_endpoint("svc-a:ns1").unwrap();
        assert_eq!(ep, EndpointDescriptor::service("svc-a", "ns1"));
    }

    #[test]
    fn test_parse_endpoint_external() {
        let ep = parse_endpoint("db.example.com").unwrap();
        assert_eq!(ep, EndpointDescriptor::external("db.example.com"));
    }

    #[test]
    fn test_parse_endpoint_rejects_dangling_colon() {
        assert!(parse_endpoint("svc-a:").is_err());
        assert!(parse_endpoint(":ns1").is_err());
        assert!(parse_endpoint("").is_err());
    }

    #[test]
    fn test_parse_pid_port() {
        let target = parse_pid_port("1234:8080").unwrap();
        assert_eq!(target, ProcessTarget { pid: 1234, port: 8080 });
    }

    #[test]
    fn test_parse_pid_port_rejects_garbage() {
        assert!(parse_pid_port("1234").is_err());
        assert!(parse_pid_port("abc:8080").is_err());
        assert!(parse_pid_port("1234:notaport").is_err());
    }

    #[test]
    fn test_parse_service_port() {
        let target = parse_service_port("nginx.service:80").unwrap();
        assert_eq!(target.service, "nginx.service");
        assert_eq!(target.port, 80);
    }

    #[test]
    fn test_hostnames_for_service_endpoint() {
        let names = hostnames_for(&EndpointDescriptor::service("svc-a", "ns1"));
        assert_eq!(names, vec!["svc-a".to_string(), "svc-a.ns1".to_string()]);
    }

    #[test]
    fn test_hostnames_for_external_endpoint() {
        let names = hostnames_for(&EndpointDescriptor::external("db.example.com"));
        assert_eq!(names, vec!["db.example.com".to_string()]);
    }

    #[test]
    fn test_render_elevation_error_names_ports() {
        let err = render_client_error(ClientError::ElevationRequired(Some(
            ElevationRequest::FreePort {
                ports: vec![80, 443],
                target_type: PortTargetType::Service,
            },
        )));
        let message = err.to_string();
        assert!(message.contains("80, 443"));
        assert!(message.contains("OS service"));
    }
}
