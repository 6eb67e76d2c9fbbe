//! Kadmesh - Kademlia node discovery

use anyhow::Result;
use clap::{Parser, Subcommand};
use kadmesh_core::{Key, NodeInfo};
use kadmesh_node::config::{expand_path, Config};
use kadmesh_node::sim::{self, SimRegistry, SimulationParams};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kadmesh")]
#[command(about = "Kademlia node discovery", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.kadmesh/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,

    /// Measure lookup convergence on an in-memory network
    Simulate {
        /// Number of simulated nodes
        #[arg(short, long, default_value = "64")]
        nodes: usize,

        /// Number of random lookups
        #[arg(short, long, default_value = "16")]
        lookups: usize,

        /// Seed for the lookup keys
        #[arg(short, long)]
        seed: Option<u64>,

        /// Simulated per-request latency in milliseconds
        #[arg(long, default_value = "0")]
        latency_ms: u64,
    },

    /// Join an in-memory network as the configured node and look up a key
    Closest {
        /// Target key (hex-encoded)
        #[arg(short, long, required = true)]
        key: String,

        /// Number of simulated nodes
        #[arg(short, long, default_value = "64")]
        nodes: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);

    match cli.command {
        Commands::Init { force } => {
            init_config(&config_path, force)?;
        }
        Commands::Show => {
            let config = load_config(&config_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Simulate { nodes, lookups, seed, latency_ms } => {
            let config = load_config(&config_path)?;
            let params = SimulationParams {
                nodes,
                lookups,
                latency: Duration::from_millis(latency_ms),
                seed,
                config: config.dht.to_kad_config(),
            };
            let report = sim::run_simulation(&params).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Closest { key, nodes } => {
            let config = load_config(&config_path)?;
            find_closest(&key, nodes, &config).await?;
        }
    }

    Ok(())
}

/// Load the config file, falling back to defaults when there is none
fn load_config(path: &std::path::Path) -> Result<Config> {
    if path.exists() {
        tracing::debug!("Loading config from {}", path.display());
        Config::load(path)
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

fn init_config(path: &std::path::Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Config already exists at: {}", path.display());
        return Ok(());
    }

    let config = Config::default();
    config.save(path)?;

    let data_dir = config.data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        tracing::info!("Created data directory: {}", data_dir.display());
    }

    println!("Initialized Kadmesh at: {}", path.display());
    println!("Node id: {}", config.node.node_id);

    Ok(())
}

async fn find_closest(key: &str, nodes: usize, config: &Config) -> Result<()> {
    let key = Key::from_hex(key).map_err(|e| anyhow::anyhow!("Invalid key: {}", e))?;
    if nodes < 2 {
        anyhow::bail!("At least two nodes are needed");
    }

    let kad_config = config.dht.to_kad_config();
    let registry = SimRegistry::new(Duration::ZERO);
    let network = sim::build_network(&registry, nodes, &kad_config).await?;

    // Join as the configured node, through its bootstrap peers if it has any
    let mut bootstrap = config.bootstrap_nodes();
    if bootstrap.is_empty() {
        bootstrap.push(network[0].local_info().clone());
    }
    let origin = sim::join(&registry, config.node_info(), &bootstrap, &kad_config).await?;

    tracing::info!("Looking up {} from {}", key, origin.node_id());
    let found: Vec<NodeInfo> = origin.find_closest_nodes(&key).await?;
    println!("{}", serde_json::to_string_pretty(&found)?);

    origin.stop();
    for node in &network {
        node.stop();
    }
    Ok(())
}
