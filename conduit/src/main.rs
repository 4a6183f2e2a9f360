use std::sync::Arc;

use args::Args;
use clap::Parser;
use config::Config;
use llm::Gateway;
use server::ServeConfig;
use tokio_util::sync::CancellationToken;

mod args;
mod logger;
mod reload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    logger::init(&args)?;

    let _telemetry = match &config.telemetry {
        Some(telemetry) => Some(telemetry::init(telemetry).await?),
        None => None,
    };

    let gateway = match Gateway::new(&config) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            log::error!("Failed to build the initial configuration snapshot: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();

    tokio::spawn(reload::on_hangup(gateway.clone(), args.config.clone()));
    tokio::spawn(shutdown_on_ctrl_c(shutdown.clone()));

    if let Err(e) = server::serve(serve_config(&args, config, gateway, shutdown)).await {
        log::error!("Server failed to start: {e}");
        std::process::exit(1);
    }

    Ok(())
}

async fn shutdown_on_ctrl_c(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {e}");
        return;
    }

    log::info!("Received Ctrl-C, draining in-flight requests");
    shutdown.cancel();
}

fn serve_config(args: &Args, config: Config, gateway: Arc<Gateway>, shutdown: CancellationToken) -> ServeConfig {
    let listen_address = config.server.bind_address(args.listen_address);

    ServeConfig {
        listen_address,
        config,
        gateway,
        shutdown,
    }
}
