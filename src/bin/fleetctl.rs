//! fleetctl - command line tool for fleetnode members
//!
//! Usage:
//!   fleetctl status           - Show node status
//!   fleetctl members          - List the other live members
//!   fleetctl audit -n 20      - Show recent state log rows
//!   fleetctl relinquish       - Make the leader give up its stint

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

use fleetnode::api::{ErrorResponse, HealthResponse, MembersResponse, RelinquishResponse, StatusResponse};

/// fleetnode control tool
#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Query and control a fleetnode member", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fleetnode.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the node
    Status,
    /// List the other live members
    Members,
    /// Show recent leadership and membership events
    Audit {
        /// Number of rows
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Force the leader to relinquish
    Relinquish,
}

#[derive(Debug, Deserialize)]
struct AuditRow {
    id: i64,
    node: String,
    state: String,
    detail: Option<String>,
    at: String,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8090".to_string()
}

/// API endpoint from the config file, with wildcard binds mapped to loopback
fn endpoint_from_config(path: &PathBuf) -> String {
    let addr = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", addr),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Members => list_members(&endpoint).await,
        Commands::Audit { limit } => show_audit(&endpoint, *limit).await,
        Commands::Relinquish => relinquish(&endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

async fn api_error(response: reqwest::Response) -> Box<dyn std::error::Error> {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(err) => format!("{} ({})", err.error, err.code).into(),
        Err(_) => format!("API error: {}", status).into(),
    }
}

async fn show_status(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/status", endpoint)).send().await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let status: StatusResponse = response.json().await?;

    let health: HealthResponse = client
        .get(format!("{}/health", endpoint))
        .send()
        .await?
        .json()
        .await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Node ID:      {}", status.node_id);
    println!("Healthy:      {}", if health.healthy { "yes" } else { "no" });
    println!("Role:         {}", if status.is_leader { "\x1b[1;34mLEADER\x1b[0m" } else { "member" });
    println!("Connection:   {}", status.connection);
    println!("Elector:      {}", status.phase);
    println!("Stints:       {}", status.stints);
    println!("Members Path: {}", status.membership_path);
    println!("Leader Path:  {}", status.election_path);
    println!();

    Ok(())
}

async fn list_members(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .get(format!("{}/members", endpoint))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let members: MembersResponse = response.json().await?;

    println!();
    println!("Members seen by {} ({} other)", members.node_id, members.members.len());
    println!("{}", "-".repeat(40));
    for member in &members.members {
        println!("{}", member);
    }
    println!();

    Ok(())
}

async fn show_audit(endpoint: &str, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .get(format!("{}/audit?limit={}", endpoint, limit))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let rows: Vec<AuditRow> = response.json().await?;

    println!();
    println!("{:<8} {:<34} {:<26} {:<20} {}", "ID", "AT", "NODE", "STATE", "DETAIL");
    println!("{}", "-".repeat(100));
    for row in &rows {
        println!(
            "{:<8} {:<34} {:<26} {:<20} {}",
            row.id,
            row.at,
            row.node,
            row.state,
            row.detail.as_deref().unwrap_or("")
        );
    }
    println!();

    Ok(())
}

async fn relinquish(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .post(format!("{}/admin/relinquish", endpoint))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let result: RelinquishResponse = response.json().await?;

    if result.relinquished {
        println!("{} relinquished leadership and re-queued", result.node_id);
    }
    Ok(())
}
