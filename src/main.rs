//! Ferry Binary Entry Point
//!
//! Parses flags, optionally detaches, then builds the Tokio runtime and runs
//! the agent until a signal (or the sender's circuit breaker) stops it.
//!
//! Exit status: 0 after a signal-initiated shutdown, 1 on a startup
//! configuration error or a second signal during shutdown, 2 when delivery
//! failed fatally.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use ferry::{
    AgentConfig, CollectorRegistry, ConfigWatcher, DeliveryQueue, Destination, DestinationPool,
    DryRunTransport, HttpTransport, Sender, SenderError, SenderOptions, Supervisor,
    config::{parse_duration, parse_global_tag},
    daemon::{self, PidFile},
    logging,
};
use tokio_util::sync::CancellationToken;

const EXIT_CONFIG: u8 = 1;
const EXIT_FATAL: u8 = 2;

/// Ferry - Host Telemetry Agent
#[derive(Parser, Debug)]
#[command(name = "ferry", version, about, long_about = None)]
struct Cli {
    /// Agent configuration file (YAML); flags override its values
    #[arg(long, env = "FERRY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding `<name>.conf` collector files
    #[arg(short = 'c', long, env = "FERRY_COLLECTOR_DIR")]
    collector_dir: Option<PathBuf>,

    /// Destination `host[:port]`; repeat for failover
    #[arg(
        short = 'H',
        long = "host",
        value_name = "HOST:PORT",
        env = "FERRY_HOSTS",
        value_delimiter = ','
    )]
    hosts: Vec<Destination>,

    /// Global tag added to every metric; repeatable
    #[arg(short = 't', long = "tag", value_name = "KEY=VALUE", value_parser = parse_global_tag)]
    tags: Vec<(String, String)>,

    /// Do not add the automatic `host=<hostname>` tag
    #[arg(long)]
    remove_host_tag: bool,

    /// Request path on each destination
    #[arg(long, env = "FERRY_HTTP_PATH")]
    http_path: Option<String>,

    /// HTTP Basic auth user name
    #[arg(long, env = "FERRY_HTTP_USERNAME")]
    http_username: Option<String>,

    /// HTTP Basic auth password
    #[arg(long, env = "FERRY_HTTP_PASSWORD", hide_env_values = true)]
    http_password: Option<String>,

    /// Token sent in every request body
    #[arg(long, env = "FERRY_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Use HTTPS
    #[arg(long)]
    ssl: bool,

    /// Skip certificate and hostname verification
    #[arg(long)]
    ssl_no_verify: bool,

    /// Delivery queue capacity
    #[arg(long, env = "FERRY_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Maximum tags per metric
    #[arg(long)]
    max_tags: Option<usize>,

    /// Raw bytes drained into one batch
    #[arg(long)]
    max_batch_bytes: Option<usize>,

    /// HTTP request timeout (e.g. "10s")
    #[arg(long, value_parser = parse_duration)]
    request_timeout: Option<Duration>,

    /// Log batches instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Detach from the terminal
    #[arg(long)]
    daemonize: bool,

    /// Write the process id to this file
    #[arg(long, env = "FERRY_PIDFILE")]
    pidfile: Option<PathBuf>,

    /// Log to this file instead of stderr
    #[arg(long, env = "FERRY_LOGFILE")]
    logfile: Option<PathBuf>,

    /// Rotate the log file at this size
    #[arg(long)]
    log_max_bytes: Option<u64>,

    /// Rotated log files to keep
    #[arg(long)]
    log_backups: Option<usize>,

    /// Collector directory poll interval (e.g. "5s")
    #[arg(long, value_parser = parse_duration)]
    poll_interval: Option<Duration>,

    /// Wait for each collector to stop before aborting it (e.g. "60s")
    #[arg(long, value_parser = parse_duration)]
    stop_timeout: Option<Duration>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Apply CLI/env overrides (CLI > ENV > config file).
    fn apply(self, config: &mut AgentConfig) {
        if let Some(dir) = self.collector_dir {
            config.collectors.dir = dir;
        }
        if let Some(interval) = self.poll_interval {
            config.collectors.poll_interval = interval;
        }
        if let Some(timeout) = self.stop_timeout {
            config.collectors.stop_timeout = timeout;
        }

        let sender = &mut config.sender;
        if !self.hosts.is_empty() {
            sender.hosts = self.hosts;
        }
        sender.tags.extend(self.tags);
        sender.remove_host_tag |= self.remove_host_tag;
        if let Some(capacity) = self.queue_capacity {
            sender.queue_capacity = capacity;
        }
        if let Some(max_tags) = self.max_tags {
            sender.max_tags = max_tags;
        }
        if let Some(bytes) = self.max_batch_bytes {
            sender.max_batch_bytes = bytes;
        }
        sender.dry_run |= self.dry_run;

        let http = &mut sender.http;
        if let Some(path) = self.http_path {
            http.path = path;
        }
        if self.http_username.is_some() {
            http.username = self.http_username;
        }
        if self.http_password.is_some() {
            http.password = self.http_password;
        }
        if self.auth_token.is_some() {
            http.auth_token = self.auth_token;
        }
        http.ssl |= self.ssl;
        if self.ssl_no_verify {
            http.ssl_verify = false;
        }
        if let Some(timeout) = self.request_timeout {
            http.request_timeout = timeout;
        }

        let logging = &mut config.logging;
        if self.logfile.is_some() {
            logging.file = self.logfile;
        }
        if let Some(bytes) = self.log_max_bytes {
            logging.max_bytes = bytes;
        }
        if let Some(backups) = self.log_backups {
            logging.backups = backups;
        }
        logging.verbose |= self.verbose;

        config.daemon.daemonize |= self.daemonize;
        if self.pidfile.is_some() {
            config.daemon.pidfile = self.pidfile;
        }
    }
}

fn load_config(cli: Cli) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    cli.apply(&mut config);
    config.expand_secrets();
    config.validate()?;
    config.make_paths_absolute()?;
    Ok(config)
}

/// Synchronous entry point: daemonize before any runtime thread exists.
fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ferry: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if config.daemon.daemonize {
        if let Err(e) = daemon::daemonize() {
            eprintln!("ferry: daemonization failed: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    // Held until exit so buffered log lines are flushed.
    let _log_guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ferry: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::from(EXIT_FATAL);
        }
    };
    runtime.block_on(run(config))
}

async fn run(config: AgentConfig) -> ExitCode {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Ferry - Host Telemetry Agent"
    );
    tracing::info!(
        collector_dir = %config.collectors.dir.display(),
        destinations = ?config.sender.hosts.iter().map(ToString::to_string).collect::<Vec<_>>(),
        queue_capacity = config.sender.queue_capacity,
        dry_run = config.sender.dry_run,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let (sink, rx) = DeliveryQueue::bounded(config.sender.queue_capacity);

    // Sender
    let options = SenderOptions::from_config(&config, None);
    tracing::info!(tags = ?options.global_tags, "Global tags");
    let pool = DestinationPool::new(config.sender.hosts.clone());
    let sender = if config.sender.dry_run {
        Sender::new(
            rx,
            pool,
            DryRunTransport::new(config.sender.http.auth_token.clone()),
            options,
        )
    } else {
        match HttpTransport::new(&config.sender.http) {
            Ok(transport) => Sender::new(rx, pool, transport, options),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create HTTP transport");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    };
    let sender = sender.spawn(shutdown.clone());

    // Supervisor
    let mut supervisor = Supervisor::new(
        ConfigWatcher::new(&config.collectors.dir),
        CollectorRegistry::with_builtins(),
        sink,
    )
    .with_poll_interval(config.collectors.poll_interval)
    .with_stop_timeout(config.collectors.stop_timeout)
    .with_sender(sender);

    if let Err(e) = supervisor.poll().await {
        tracing::error!(
            dir = %config.collectors.dir.display(),
            error = %e,
            "Cannot read collector directory"
        );
        let _ = supervisor.shutdown().await;
        return ExitCode::from(EXIT_CONFIG);
    }

    let _pidfile = match &config.daemon.pidfile {
        Some(path) => match PidFile::create(path) {
            Ok(pidfile) => Some(pidfile),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to write PID file");
                let _ = supervisor.shutdown().await;
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => None,
    };

    let mut agent = tokio::spawn(supervisor.run(shutdown.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutting down");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {
            tracing::warn!("Shutdown requested internally");
        }
    }

    let result = tokio::select! {
        result = &mut agent => result,
        _ = shutdown_signal() => {
            tracing::warn!("Second signal received, exiting immediately");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match result {
        Ok(Ok(())) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(Err(e @ SenderError::CircuitBreaker(_))) => {
            tracing::error!(error = %e, "Exiting after delivery failure");
            ExitCode::from(EXIT_FATAL)
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Shutdown failed");
            ExitCode::from(EXIT_FATAL)
        }
        Err(e) => {
            tracing::error!(error = %e, "Supervisor task failed");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "ferry",
            "-c",
            "/tmp/collectors",
            "-H",
            "tsdb1:4242",
            "-H",
            "tsdb2",
            "-t",
            "dc=east",
            "--max-tags",
            "6",
            "--poll-interval",
            "2s",
            "--ssl-no-verify",
            "-v",
        ])
        .unwrap();

        let mut config = AgentConfig::default();
        config.sender.tags.insert("role".into(), "web".into());
        cli.apply(&mut config);

        assert_eq!(config.collectors.dir, PathBuf::from("/tmp/collectors"));
        assert_eq!(config.sender.hosts.len(), 2);
        assert_eq!(config.sender.hosts[1].port, 4242);
        assert_eq!(config.sender.tags["dc"], "east");
        assert_eq!(config.sender.tags["role"], "web");
        assert_eq!(config.sender.max_tags, 6);
        assert_eq!(config.collectors.poll_interval, Duration::from_secs(2));
        assert!(!config.sender.http.ssl_verify);
        assert!(config.logging.verbose);
    }

    #[test]
    fn test_invalid_tag_rejected() {
        assert!(Cli::try_parse_from(["ferry", "-t", "no-equals"]).is_err());
        assert!(Cli::try_parse_from(["ferry", "-t", "k=has space"]).is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
