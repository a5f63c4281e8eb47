use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use medrec_agent::agent::Agent;
use medrec_agent::config::AgentConfig;
use medrec_agent::server::run_server;

#[derive(Parser)]
#[command(author, version, about = "Medical-records benchmark agent")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => {
            let mut config = AgentConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }

    let agent = Arc::new(Agent::new(&config));
    run_server(agent, &config).await
}
