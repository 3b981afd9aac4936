//! Slate - Gossip-Replicated Key/Value Store
//!
//! Runs a replica node, or talks to a running node's HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slate::api::{HttpServer, RecordView, StatusResponse};
use slate::config::{SlateConfig, StorageKind};
use slate::error::{Error, Result};
use slate::membership::{NeighborList, NeighborsFile, StaticNeighbors};
use slate::network::{NetworkClient, NetworkServer};
use slate::node::Node;
use slate::replication::TcpTransport;
use slate::store::{MemoryBackend, SqliteBackend, StorageBackend};

/// Slate - Gossip-Replicated Key/Value Store
#[derive(Parser)]
#[command(name = "slate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "slate.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// HTTP API of the node to talk to
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Slate node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "slate.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Write a value
    Put {
        key: String,
        value: String,
    },

    /// Read a value
    Get {
        key: String,
    },

    /// List the most recently written records
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show node status
    Status,

    /// Run an anti-entropy round now
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        command => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            let endpoint = endpoint_url(&cli.endpoint);
            let result = match command {
                Commands::Put { key, value } => run_put(&endpoint, &key, value).await,
                Commands::Get { key } => run_get(&endpoint, &key).await,
                Commands::List { limit } => run_list(&endpoint, limit).await,
                Commands::Status => run_status(&endpoint).await,
                Commands::Sync => run_sync(&endpoint).await,
                _ => Ok(()),
            };
            if let Err(e) = &result {
                eprintln!("Error: {}", e);
            }
            result
        }
    }
}

fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the Slate node
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match SlateConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    tracing::info!("Starting Slate node {}", config.node.id);

    let node_id = config.node_id();

    let backend: Arc<dyn StorageBackend> = match config.storage.backend {
        StorageKind::Sqlite => {
            if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
                tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
                return Err(e.into());
            }
            Arc::new(SqliteBackend::new(config.data_dir().clone(), config.storage.compression)?)
        }
        StorageKind::Memory => {
            tracing::warn!("Using in-memory storage; records are lost on restart");
            Arc::new(MemoryBackend::new())
        }
    };

    let neighbors: Arc<dyn NeighborList> = match &config.cluster.neighbors_file {
        Some(path) => {
            tracing::info!("Reading neighbors from {:?}", path);
            Arc::new(NeighborsFile::new(path.clone(), node_id.clone()))
        }
        None => {
            tracing::info!("Using {} configured neighbors", config.cluster.neighbors.len());
            Arc::new(StaticNeighbors::new(&node_id, config.neighbors()))
        }
    };

    let transport = Arc::new(TcpTransport::new(NetworkClient::new(
        config.connect_timeout(),
        config.request_timeout(),
    )));

    let replication = config.replication();
    let node = Node::new(node_id, backend, neighbors, transport, replication.clone()).await?;

    // Peer server first so neighbors recovering their own counters can reach us
    let peer_server = Arc::new(NetworkServer::new(
        config.node.bind_address.clone(),
        node.clone(),
    ));
    let peer_task = {
        let server = Arc::clone(&peer_server);
        tokio::spawn(async move { server.start().await })
    };

    if replication.recover_counter_on_start {
        match node.recover_counter().await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::warn!("Counter recovery skipped: {}", e),
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let anti_entropy = node.spawn_anti_entropy(shutdown_rx);

    let api_server = HttpServer::new(config.api.clone(), node.clone());
    let api_task = tokio::spawn(async move { api_server.start().await });

    tracing::info!("Node {} ready", node.node_id());

    // A disabled API returns at once, so only watch it when enabled
    let outcome = tokio::select! {
        result = peer_task => server_exit("Peer server", result),
        result = api_task, if config.api.enabled => server_exit("HTTP API", result),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    peer_server.stop();
    if let Err(e) = anti_entropy.await {
        tracing::warn!("Anti-entropy task ended abnormally: {}", e);
    }

    tracing::info!("Slate node stopped");
    outcome
}

/// Map a server task's exit to the node's exit status
fn server_exit(
    name: &str,
    result: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            tracing::info!("{} exited", name);
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("{} error: {}", name, e);
            Err(e)
        }
        Err(e) => {
            tracing::error!("{} task failed: {}", name, e);
            Err(Error::Internal(format!("{} task failed: {}", name, e)))
        }
    }
}

/// Initialize a configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# Slate Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7654"
data_dir = "/var/lib/slate/{node_id}"

[cluster]
anti_entropy_interval_ms = 60000
anti_entropy_jitter_ms = 5000
connect_timeout_ms = 2000
request_timeout_ms = 10000
push_queue_size = 1024
recover_counter_on_start = true
# neighbors_file = "/run/slate/neighbors.json"

# [[cluster.neighbors]]
# id = "node-2"
# address = "node-2.example.com:7654"

[storage]
backend = "sqlite"
compression = true

[api]
enabled = true
bind_address = "127.0.0.1:8080"

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your neighbors.");
    println!("Then start with: slate --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match SlateConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            match &config.cluster.neighbors_file {
                Some(path) => println!("  Neighbors: from {}", path.display()),
                None => println!("  Neighbors: {}", config.cluster.neighbors.len()),
            }
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
    let config = SlateConfig::from_file(&config_path)?;

    println!("Slate Node Information");
    println!("======================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Storage:");
    println!("  Backend:        {:?}", config.storage.backend);
    println!("  Compression:    {}", config.storage.compression);
    println!();
    println!("Cluster Configuration:");
    for neighbor in &config.cluster.neighbors {
        println!("  Neighbor:       {} ({})", neighbor.id, neighbor.address);
    }
    if let Some(path) = &config.cluster.neighbors_file {
        println!("  Neighbors File: {}", path.display());
    }
    println!("  Anti-Entropy:   every {} ms (+ up to {} ms)",
        config.cluster.anti_entropy_interval_ms,
        config.cluster.anti_entropy_jitter_ms);
    println!("  Timeouts:       connect {} ms, request {} ms",
        config.cluster.connect_timeout_ms,
        config.cluster.request_timeout_ms);
    println!();
    println!("HTTP API:         {}", if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" });

    Ok(())
}

// ============ API client commands ============

fn endpoint_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// `/kv/<key>` with the key percent-encoded as one path segment
fn key_url(endpoint: &str, key: &str) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(&format!("{}/kv", endpoint))
        .map_err(|e| Error::Config(format!("Invalid endpoint {}: {}", endpoint, e)))?;
    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("Endpoint {} cannot take a path", endpoint)))?
        .push(key);
    Ok(url)
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Network(format!("API error {}: {}", status, body)))
}

fn print_record(record: &RecordView) {
    let value = match (&record.value, &record.value_bytes) {
        (Some(text), _) => text.clone(),
        (None, Some(bytes)) => format!("{:?}", bytes),
        (None, None) => String::new(),
    };
    println!("{:<24} {:<16} {:<28} {}", record.key, record.version, record.timestamp.to_rfc3339(), value);
}

async fn run_put(endpoint: &str, key: &str, value: String) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .put(key_url(endpoint, key)?)
        .body(value)
        .send()
        .await?;
    let record: RecordView = check(response).await?.json().await?;

    println!("Stored {} as {} with clock {}", record.key, record.version, record.clock);
    Ok(())
}

async fn run_get(endpoint: &str, key: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client.get(key_url(endpoint, key)?).send().await?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        println!("{}: not found", key);
        return Ok(());
    }

    let record: RecordView = check(response).await?.json().await?;
    print_record(&record);
    Ok(())
}

async fn run_list(endpoint: &str, limit: usize) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/kv?limit={}", endpoint, limit))
        .send()
        .await?;
    let records: Vec<RecordView> = check(response).await?.json().await?;

    println!("{:<24} {:<16} {:<28} {}", "KEY", "VERSION", "TIMESTAMP", "VALUE");
    println!("{}", "-".repeat(80));
    for record in &records {
        print_record(record);
    }
    Ok(())
}

async fn run_status(endpoint: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client.get(format!("{}/status", endpoint)).send().await?;
    let status: StatusResponse = check(response).await?.json().await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Node ID:      {}", status.node_id);
    println!("Counter:      {}", status.last_counter);
    println!("Clock:        {}", status.clock);
    println!("Neighbors:    {} ({} online)", status.neighbors, status.online_neighbors);
    println!("AE Rounds:    {}", status.anti_entropy_rounds);
    println!("Uptime:       {}s", status.uptime_seconds);
    println!();

    Ok(())
}

async fn run_sync(endpoint: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client.post(format!("{}/sync", endpoint)).send().await?;
    let report: serde_json::Value = check(response).await?.json().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
