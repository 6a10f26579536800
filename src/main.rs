// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use gateway::config::{Cli, GatewayConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log = cli.log.clone();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log)),
        )
        .init();

    let config = match GatewayConfig::load(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("invalid config: {e}");
        }
        std::process::exit(1);
    }

    if let Err(e) = gateway::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
