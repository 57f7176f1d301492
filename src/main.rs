use relay_server::{RelayConfig, RelayServer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = RelayConfig::from_env();
    let server = RelayServer::builder(config).build().await?;

    tracing::info!(addr = %server.local_addr(), "relay listening");

    server.run().await?;
    Ok(())
}
