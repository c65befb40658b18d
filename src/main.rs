use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use nodewatch::client::{
    wait_for_api, KubeApiClient, MockNodeApi, NodeApi, ProblemClient, Reporter,
};
use nodewatch::config::{
    load_from_path, validate_exclusive_condition_types, ClientConfig, LogMonitorConfig,
    PluginMonitorConfig,
};
use nodewatch::detector::ProblemDetector;
use nodewatch::monitors::{LogMonitor, Monitor, PluginMonitor};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Command-line arguments for the node problem monitor
#[derive(Parser, Debug)]
#[command(
    name = "nodewatch",
    about = "Node health monitor - detects node problems from logs and check plugins",
    long_about = "Watches system logs and runs check plugins, classifies what they report \
                  into node conditions and events, and publishes them to the cluster API server."
)]
struct Cli {
    /// Log monitor configuration files
    #[arg(long = "log-monitor-config", value_name = "FILE")]
    log_monitor_configs: Vec<PathBuf>,

    /// Plugin monitor configuration files
    #[arg(long = "plugin-monitor-config", value_name = "FILE")]
    plugin_monitor_configs: Vec<PathBuf>,

    /// Client settings file (TOML)
    #[arg(long, value_name = "FILE")]
    client_config: Option<PathBuf>,

    /// Name of this node
    #[arg(long)]
    node_name: Option<String>,

    /// API server base URL
    #[arg(long)]
    api_server: Option<String>,

    /// File holding the bearer token for the API server
    #[arg(long, value_name = "FILE")]
    token_file: Option<PathBuf>,

    /// Seconds to wait for the API server at startup
    #[arg(long, default_value_t = 30)]
    api_wait_timeout: u64,

    /// Seconds between API reachability checks at startup
    #[arg(long, default_value_t = 5)]
    api_wait_interval: u64,

    /// Keep reports in memory instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Client settings from the optional file with flag overrides applied
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.client_config {
            Some(path) => load_from_path::<ClientConfig>(path)
                .with_context(|| format!("loading client config {}", path.display()))?,
            None => ClientConfig::default(),
        };
        if let Some(node_name) = &self.node_name {
            config.node_name = node_name.clone();
        }
        if let Some(api_server) = &self.api_server {
            config.api_server = api_server.clone();
        }
        if let Some(token_file) = &self.token_file {
            config.token_file = Some(token_file.clone());
        }
        config.validate().context("invalid client config")?;
        Ok(config)
    }
}

/// Drop paths already seen, warning about each duplicate
fn unique_paths(paths: &[PathBuf], seen: &mut HashSet<PathBuf>) -> Vec<PathBuf> {
    paths
        .iter()
        .filter(|path| {
            let fresh = seen.insert((*path).clone());
            if !fresh {
                warn!("Skipping duplicate monitor config {}", path.display());
            }
            fresh
        })
        .cloned()
        .collect()
}

/// Load every monitor config and check condition type ownership
fn load_monitors(cli: &Cli) -> Result<Vec<Box<dyn Monitor>>> {
    let mut seen = HashSet::new();
    let mut monitors: Vec<Box<dyn Monitor>> = Vec::new();
    let mut claims = Vec::new();

    for path in unique_paths(&cli.log_monitor_configs, &mut seen) {
        let config: LogMonitorConfig = load_from_path(&path)
            .with_context(|| format!("loading log monitor config {}", path.display()))?;
        claims.push((config.source.clone(), config.condition_types()?));
        let monitor = LogMonitor::new(config)
            .with_context(|| format!("building log monitor from {}", path.display()))?;
        monitors.push(Box::new(monitor));
    }

    for path in unique_paths(&cli.plugin_monitor_configs, &mut seen) {
        let config: PluginMonitorConfig = load_from_path(&path)
            .with_context(|| format!("loading plugin monitor config {}", path.display()))?;
        claims.push((config.source.clone(), config.condition_types()?));
        let monitor = PluginMonitor::new(config)
            .with_context(|| format!("building plugin monitor from {}", path.display()))?;
        monitors.push(Box::new(monitor));
    }

    if monitors.is_empty() {
        bail!("no monitor configured, pass --log-monitor-config or --plugin-monitor-config");
    }
    validate_exclusive_condition_types(&claims)?;
    Ok(monitors)
}

fn run(cli: Cli) -> Result<()> {
    let monitors = load_monitors(&cli)?;
    let client_config = cli.client_config()?;
    info!(
        "Loaded {} monitors for node {}",
        monitors.len(),
        client_config.node_name
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("nodewatch-reporter")
        .build()
        .context("creating reporter runtime")?;

    let api: Arc<dyn NodeApi> = if cli.dry_run {
        info!("Dry run, reports stay in memory");
        Arc::new(MockNodeApi::new(&client_config.node_name))
    } else {
        Arc::new(KubeApiClient::new(&client_config).context("creating API client")?)
    };
    let client = Arc::new(ProblemClient::new(api));

    if !runtime.block_on(wait_for_api(
        &client,
        Duration::from_secs(cli.api_wait_interval),
        Duration::from_secs(cli.api_wait_timeout),
    )) {
        warn!("Continuing without a confirmed API connection");
    }

    let reporter = {
        let _guard = runtime.enter();
        Arc::new(Reporter::spawn(Arc::clone(&client), &client_config))
    };

    let mut detector = ProblemDetector::new(monitors, reporter.clone());
    let shutdown = detector.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down gracefully...");
        shutdown.shutdown();
    })
    .context("setting interrupt handler")?;

    info!("Node monitor is running. Press Ctrl+C to stop.");
    detector.run().context("running problem detector")?;

    runtime.block_on(reporter.shutdown());
    let stats = reporter.stats();
    info!(
        "Shutdown complete: {} condition writes, {} events sent, {} events dropped",
        stats.conditions_uploaded, stats.events_sent, stats.events_dropped
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_config_flags() {
        let cli = Cli::try_parse_from([
            "nodewatch",
            "--log-monitor-config",
            "kernel.toml",
            "--log-monitor-config",
            "docker.toml",
            "--plugin-monitor-config",
            "ntp.json",
            "--node-name",
            "node-a",
        ])
        .unwrap();
        assert_eq!(cli.log_monitor_configs.len(), 2);
        assert_eq!(cli.plugin_monitor_configs.len(), 1);
        assert_eq!(cli.api_wait_timeout, 30);
    }

    #[test]
    fn test_duplicate_paths_skipped_across_kinds() {
        let mut seen = HashSet::new();
        let logs = unique_paths(
            &[PathBuf::from("a.toml"), PathBuf::from("a.toml")],
            &mut seen,
        );
        let plugins = unique_paths(
            &[PathBuf::from("a.toml"), PathBuf::from("b.toml")],
            &mut seen,
        );
        assert_eq!(logs, vec![PathBuf::from("a.toml")]);
        assert_eq!(plugins, vec![PathBuf::from("b.toml")]);
    }

    #[test]
    fn test_flags_override_client_config() {
        let cli = Cli::try_parse_from([
            "nodewatch",
            "--node-name",
            "node-a",
            "--api-server",
            "https://10.0.0.1:6443",
        ])
        .unwrap();
        let config = cli.client_config().unwrap();
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.api_server, "https://10.0.0.1:6443");
    }

    #[test]
    fn test_missing_node_name_rejected() {
        let cli = Cli::try_parse_from(["nodewatch"]).unwrap();
        assert!(cli.client_config().is_err());
    }

    #[test]
    fn test_no_monitors_is_an_error() {
        let cli = Cli::try_parse_from(["nodewatch", "--node-name", "node-a"]).unwrap();
        assert!(load_monitors(&cli).is_err());
    }
}
