//! The `run` command - serves the gateway on the AUN transport.

use crate::config;
use clap::Args;
use econet_net::{AunTransport, Gateway, GatewayTables, TcpDialer};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args)]
pub struct RunArgs {
    /// Path to configuration file
    #[arg(long, short)]
    config: PathBuf,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = config::load(&args.config)?;
    let tables = GatewayTables::load(&config.tables)?;

    let transport = AunTransport::bind(&config.aun).await?;
    tracing::info!(
        "AUN: listening on {} as {} with {} stations",
        transport.local_addr()?,
        config.aun.local,
        config.aun.stations.len()
    );

    let dialer = Arc::new(TcpDialer::new(config.flows.connect_timeout()));
    let mut gateway = Gateway::new(config.aun.local, tables, dialer, &config.flows);

    tokio::select! {
        result = gateway.run(transport) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Gateway: shutting down ({} open flows)", gateway.tracker().flow_count());
        }
    }

    Ok(())
}
