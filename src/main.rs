use clap::{Parser, Subcommand};

use hostnic_agent::{config::AgentConfig, daemon};

/// VPC host NIC agent.
#[derive(Parser, Debug)]
#[clap(author, version, about = "Per-node VPC hostnic agent: NIC allocation and fleet IPAM")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent daemon
    Agent {
        #[clap(flatten)]
        config: AgentConfig,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Agent { config } => daemon::run(config).await,
    }
}
