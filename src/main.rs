//! Kilo API Gateway binary entry point.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use kilo_gateway::{Error, cli::Cli, config::Config, server::Gateway, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.listen_addr = override_port(&config.server.listen_addr, port);
            }
            if let Some(ref host) = cli.host {
                config.server.listen_addr = override_host(&config.server.listen_addr, host);
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::from(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %config.server.listen_addr,
        routes = config.routes.len(),
        "starting Kilo gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(Error::Config(e)) => {
            error!("Invalid gateway configuration: {e}");
            return ExitCode::from(1);
        }
        Err(e) => {
            error!("Failed to open token store / initialize gateway: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("gateway shutdown complete");
    ExitCode::SUCCESS
}

fn override_port(listen_addr: &str, port: u16) -> String {
    match listen_addr.parse::<SocketAddr>() {
        Ok(mut addr) => {
            addr.set_port(port);
            addr.to_string()
        }
        Err(_) => listen_addr.to_string(),
    }
}

fn override_host(listen_addr: &str, host: &str) -> String {
    let port = listen_addr
        .parse::<SocketAddr>()
        .map_or(8000, |addr| addr.port());
    format!("{host}:{port}")
}
