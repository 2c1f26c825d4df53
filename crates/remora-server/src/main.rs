use std::net::IpAddr;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use remora_server::{Server, ServerConfig, DEFAULT_PORT};

/// Single-connection remote-memory channel server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address to listen on.
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: args.address,
        port: args.port,
        ..ServerConfig::default()
    };

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(addr = %server.local_addr(), "remora server up");

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server failed");
            ExitCode::FAILURE
        }
    }
}
