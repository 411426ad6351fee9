mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::{run::RunArgs, tables::TablesArgs, version::VersionArgs};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "econet-gw")]
#[command(about = "IPv4 gateway and TCP NAT for Econet stations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run(RunArgs),

    /// Load and print the interface, route and NAT tables
    Tables(TablesArgs),

    /// Show version information
    Version(VersionArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::run(args).await?,
        Commands::Tables(args) => commands::tables::run(args)?,
        Commands::Version(args) => commands::version::run(args),
    }

    Ok(())
}
