use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use molt_ecdysis::Upgrader;
use molt_server::{
    telemetry, EchoOptions, EchoServer, ServerContext, ServerRegistry, Upgrade, UpgradeConfig,
};

#[derive(Parser)]
#[command(name = "molt-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pid file written once this generation is ready
    #[arg(long, default_value = "main.pid")]
    pid_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("molt server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = UpgradeConfig::from_env().with_pid_file(args.pid_file);
    config.log_config();

    let upgrader = Upgrader::from_env(config.upgrader_options())
        .map_err(|e| anyhow::anyhow!("Failed to adopt inherited descriptors: {}", e))?;
    let ctx = ServerContext::new(upgrader, std::process::id());

    let mut registry = ServerRegistry::new();
    registry.register(Arc::new(EchoServer::new(
        ctx.clone(),
        EchoOptions::from_config(&config),
    )))?;

    Upgrade::new(config, ctx, registry).run().await?;

    telemetry::shutdown();

    Ok(())
}
