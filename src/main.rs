use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cdproxy::Cli;
use cdproxy::config::ProxyConfig;
use cdproxy::server::ProxyServer;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = ProxyConfig::from_cli(&cli);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .init();

    let server = Arc::new(ProxyServer::new(config));
    if let Err(e) = server.run().await {
        error!("{e}");
        std::process::exit(1);
    }
}
