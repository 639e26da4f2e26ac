use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use pkg_constants::{network, paths};
use pkg_controller::GatewayOptions;
use pkg_types::config::{GatewayConfigFile, load_config_file};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "kato-gateway", about = "KATO edge gateway controller")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, env = "KATO_GATEWAY_CONFIG", default_value = paths::DEFAULT_GATEWAY_CONFIG)]
    config: String,

    /// Log output format
    #[arg(long, env = "KATO_GATEWAY_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Cluster API server address
    #[arg(long, env = "KATO_GATEWAY_API_SERVER")]
    api_server: Option<String>,

    /// Bearer token for the cluster API
    #[arg(long, env = "KATO_GATEWAY_API_TOKEN")]
    api_token: Option<String>,

    /// Node name used as lease holder (defaults to the hostname)
    #[arg(long, env = "KATO_GATEWAY_NODE_NAME")]
    node_name: Option<String>,

    #[arg(long, env = "KATO_GATEWAY_HTTP_PORT")]
    http_port: Option<u16>,

    #[arg(long, env = "KATO_GATEWAY_HTTPS_PORT")]
    https_port: Option<u16>,

    /// Loopback port of the proxy's stream configuration server
    #[arg(long, env = "KATO_GATEWAY_STREAM_PORT")]
    stream_port: Option<u16>,

    /// Loopback port of the proxy's status server
    #[arg(long, env = "KATO_GATEWAY_STATUS_PORT")]
    status_port: Option<u16>,

    /// Port serving /healthz, /metrics and /v1/ports
    #[arg(long, env = "KATO_GATEWAY_HEALTH_PORT")]
    health_port: Option<u16>,

    /// Loopback port receiving per-request samples from the proxy
    #[arg(long, env = "KATO_GATEWAY_MONITOR_PORT")]
    monitor_port: Option<u16>,

    /// Directory for the coordination store
    #[arg(long, env = "KATO_GATEWAY_STATE_DIR")]
    state_dir: Option<String>,

    /// Timeout for every external call, in seconds
    #[arg(long, env = "KATO_GATEWAY_CALL_TIMEOUT_SECS")]
    call_timeout_secs: Option<u64>,

    /// Interfaces whose addresses are never published
    #[arg(long, env = "KATO_GATEWAY_IGNORE_INTERFACES", value_delimiter = ',')]
    ignore_interfaces: Option<Vec<String>>,

    /// Reconcile rate limit in tasks per second (0 disables limiting)
    #[arg(long, env = "KATO_GATEWAY_SYNC_RATE")]
    sync_rate: Option<f64>,

    #[arg(long, env = "KATO_GATEWAY_SYNC_BURST")]
    sync_burst: Option<u32>,

    #[arg(long, env = "KATO_GATEWAY_MIN_LB_PORT")]
    min_lb_port: Option<u16>,

    #[arg(long, env = "KATO_GATEWAY_MAX_LB_PORT")]
    max_lb_port: Option<u16>,

    /// Access log path; empty disables access logging
    #[arg(long, env = "KATO_GATEWAY_ACCESS_LOG")]
    access_log: Option<String>,

    #[arg(long, env = "KATO_GATEWAY_ENABLE_METRICS")]
    enable_metrics: Option<bool>,

    #[arg(long, env = "KATO_GATEWAY_ENABLE_SSL_STAPLING")]
    enable_ssl_stapling: Option<bool>,

    #[arg(long, env = "KATO_GATEWAY_RETRY_NON_IDEMPOTENT")]
    retry_non_idempotent: Option<bool>,

    #[arg(long, env = "KATO_GATEWAY_NGINX_BINARY")]
    nginx_binary: Option<String>,

    /// Directory the proxy configuration is materialized into
    #[arg(long, env = "KATO_GATEWAY_CONF_DIR")]
    conf_dir: Option<String>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn default_node_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Merge: CLI/env > config file > defaults.
fn resolve(cli: Cli, file: GatewayConfigFile) -> GatewayOptions {
    GatewayOptions {
        node_name: cli
            .node_name
            .or(file.node_name)
            .unwrap_or_else(default_node_name),
        api_server: cli
            .api_server
            .or(file.api_server)
            .unwrap_or_else(|| network::DEFAULT_API_ADDR.to_string()),
        api_token: cli.api_token.or(file.api_token),
        http_port: cli
            .http_port
            .or(file.http_port)
            .unwrap_or(network::DEFAULT_HTTP_PORT),
        https_port: cli
            .https_port
            .or(file.https_port)
            .unwrap_or(network::DEFAULT_HTTPS_PORT),
        stream_port: cli
            .stream_port
            .or(file.stream_port)
            .unwrap_or(network::DEFAULT_STREAM_PORT),
        status_port: cli
            .status_port
            .or(file.status_port)
            .unwrap_or(network::DEFAULT_STATUS_PORT),
        health_port: cli
            .health_port
            .or(file.health_port)
            .unwrap_or(network::DEFAULT_HEALTH_PORT),
        monitor_port: cli
            .monitor_port
            .or(file.monitor_port)
            .unwrap_or(network::DEFAULT_MONITOR_PORT),
        state_dir: cli
            .state_dir
            .or(file.state_dir)
            .unwrap_or_else(|| paths::DEFAULT_STATE_DIR.to_string()),
        call_timeout: Duration::from_secs(
            cli.call_timeout_secs
                .or(file.call_timeout_secs)
                .unwrap_or(network::DEFAULT_CALL_TIMEOUT_SECS),
        ),
        ignore_interfaces: cli
            .ignore_interfaces
            .or(file.ignore_interfaces)
            .unwrap_or_else(|| {
                network::DEFAULT_IGNORED_INTERFACES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }),
        sync_rate: cli.sync_rate.or(file.sync_rate).unwrap_or(1.0),
        sync_burst: cli.sync_burst.or(file.sync_burst).unwrap_or(1),
        min_lb_port: cli
            .min_lb_port
            .or(file.min_lb_port)
            .unwrap_or(network::DEFAULT_MIN_LB_PORT),
        max_lb_port: cli
            .max_lb_port
            .or(file.max_lb_port)
            .unwrap_or(network::DEFAULT_MAX_LB_PORT),
        access_log: cli.access_log.or(file.access_log).unwrap_or_default(),
        enable_metrics: cli.enable_metrics.or(file.enable_metrics).unwrap_or(true),
        enable_ssl_stapling: cli
            .enable_ssl_stapling
            .or(file.enable_ssl_stapling)
            .unwrap_or(false),
        retry_non_idempotent: cli
            .retry_non_idempotent
            .or(file.retry_non_idempotent)
            .unwrap_or(false),
        nginx_binary: PathBuf::from(
            cli.nginx_binary
                .or(file.nginx_binary)
                .unwrap_or_else(|| paths::DEFAULT_NGINX_BINARY.to_string()),
        ),
        conf_dir: PathBuf::from(
            cli.conf_dir
                .or(file.conf_dir)
                .unwrap_or_else(|| paths::DEFAULT_CONF_DIR.to_string()),
        ),
    }
}

/// Cancel `token` on the first SIGTERM, SIGINT or SIGQUIT.
fn watch_signals(token: CancellationToken) -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
            _ = quit.recv() => "SIGQUIT",
        };
        info!("Received {}, shutting down", name);
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Err(e) = run(cli).await {
        error!("kato-gateway exited with error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let file_cfg: GatewayConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);
    let options = resolve(cli, file_cfg);

    info!("Starting kato-gateway");
    info!("  Node:        {}", options.node_name);
    info!("  API server:  {}", options.api_server);
    info!("  State dir:   {}", options.state_dir);
    info!("  Conf dir:    {}", options.conf_dir.display());
    info!("  LB ports:    {}-{}", options.min_lb_port, options.max_lb_port);

    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone())?;
    pkg_controller::run(options, shutdown).await
}
