//! fleetnode - fleet membership and leader election node
//!
//! Runs one fleet member against a coordination ensemble, or a standalone
//! development ensemble for members to connect to.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetnode::api::HttpServer;
use fleetnode::audit::{AuditSink, FanoutAudit, StateLog, TracingAudit};
use fleetnode::config::{FleetNodeConfig, LoggingConfig};
use fleetnode::election::ParkUntilCancelled;
use fleetnode::ensemble::EnsembleTree;
use fleetnode::error::Result;
use fleetnode::identity::{NodeIdentity, PathLayout};
use fleetnode::network::{EnsembleServer, RemoteEnsemble};
use fleetnode::node::ClusterNode;

/// fleetnode - fleet membership and leader election node
#[derive(Parser)]
#[command(name = "fleetnode")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "fleetnode.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the fleet and contend for leadership
    Start,

    /// Run a standalone development ensemble
    Ensemble {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:2181")]
        listen: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "fleetnode.toml")]
        output: PathBuf,

        /// Ensemble address
        #[arg(long, default_value = "127.0.0.1:2181")]
        ensemble: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = FleetNodeConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Ensemble { listen } => run_ensemble(listen).await,
        Commands::Init { output, ensemble } => run_init(output, ensemble),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start a fleet member
async fn run_start(config_path: PathBuf) -> Result<()> {
    let config = match FleetNodeConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    let state_log = if config.state_log.enabled {
        match StateLog::open(&config.state_log.path) {
            Ok(log) => {
                tracing::info!("State log at {}", config.state_log.path.display());
                Some(Arc::new(log))
            }
            Err(e) => {
                tracing::error!("Failed to open state log {:?}: {}", config.state_log.path, e);
                return Err(e);
            }
        }
    } else {
        None
    };

    let mut audit = FanoutAudit::new().with(Arc::new(TracingAudit));
    if let Some(log) = &state_log {
        audit = audit.with(log.clone() as Arc<dyn AuditSink>);
    }

    let backend = Arc::new(RemoteEnsemble::from_config(&config.ensemble));
    let node = Arc::new(ClusterNode::new(
        config.clone(),
        backend,
        Arc::new(ParkUntilCancelled),
        Arc::new(audit),
    )?);
    tracing::info!(
        "Starting node {} against ensemble {}",
        node.service_name(),
        config.ensemble.address
    );

    let http_server = Arc::new(HttpServer::new(config.api.clone(), node.clone(), state_log));
    let http_task = {
        let server = http_server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("HTTP server error: {}", e);
            }
        })
    };

    let (started, interrupted) = tokio::select! {
        result = node.start() => (result, false),
        _ = tokio::signal::ctrl_c() => (Ok(()), true),
    };

    match &started {
        Err(e) => tracing::error!("Node failed to start: {}", e),
        Ok(()) if !interrupted => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Received shutdown signal");
        }
        Ok(()) => tracing::info!("Received shutdown signal while starting"),
    }

    http_server.stop();
    if let Err(e) = node.close().await {
        tracing::error!("Error closing node: {}", e);
    }
    let _ = http_task.await;

    started
}

/// Run the development ensemble
async fn run_ensemble(listen: String) -> Result<()> {
    tracing::warn!("Development ensemble: single server, state is lost on exit");
    let server = EnsembleServer::new(listen, Arc::new(EnsembleTree::new()));

    tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
            Ok(())
        }
    }
}

/// Write a starter configuration file
fn run_init(output: PathBuf, ensemble: String) -> Result<()> {
    let config_content = format!(r#"# fleetnode configuration

[node]
# host = "10.0.0.5"       # advertised host, detected when unset
listener_retry_ms = 1000

[ensemble]
address = "{ensemble}"
session_timeout_ms = 60000
connect_timeout_ms = 15000
retry_interval_ms = 1000

[paths]
root = "/fleet"
membership = "members"
election = "leader"

[election]
auto_requeue = true
contend_retry_ms = 1000

[registration]
attempts = 3
backoff_ms = 500

[api]
enabled = true
bind_address = "0.0.0.0:8090"

[logging]
level = "info"
format = "pretty"

[state_log]
enabled = false
path = "/var/lib/fleetnode/state.db"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: fleetnode --config {} start", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match FleetNodeConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Ensemble:   {}", config.ensemble.address);
            println!("  Root Path:  {}", config.paths.root);
            println!("  HTTP API:   {}", if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" });
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = FleetNodeConfig::from_file(&config_path)?;
    let identity = NodeIdentity::detect(config.node.host.as_deref());
    let layout = PathLayout::new(&config.paths, &identity)?;

    println!("fleetnode Information");
    println!("=====================");
    println!();
    println!("Identity:         {} (epoch assigned at start)", identity.host);
    println!("Ensemble:         {}", config.ensemble.address);
    println!("Session Timeout:  {} ms", config.ensemble.session_timeout_ms);
    println!();
    println!("Paths:");
    println!("  Membership:     {}", layout.membership_path);
    println!("  Election:       {}", layout.election_path);
    println!();
    println!("Election:");
    println!("  Auto Requeue:   {}", config.election.auto_requeue);
    println!("  Contend Retry:  {} ms", config.election.contend_retry_ms);
    println!();
    println!("State Log:        {}", if config.state_log.enabled {
        config.state_log.path.display().to_string()
    } else {
        "disabled".to_string()
    });

    Ok(())
}
