use glint_proxy::{ProxyConfig, ProxyServer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = ProxyConfig::default();

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let server = match ProxyServer::builder(config.clone()).build() {
        Ok(server) => server,
        Err(error) => {
            eprintln!("failed to build proxy: {error}");
            std::process::exit(1);
        }
    };

    if let Some(mut exchanges) = server.take_exchanges() {
        tokio::spawn(async move {
            while let Some(exchange) = exchanges.recv().await {
                match serde_json::to_string(&exchange) {
                    Ok(json) => tracing::info!(target: "glint::exchange", "{json}"),
                    Err(error) => tracing::warn!(error = %error, "exchange serialization failed"),
                }
            }
        });
    }

    tracing::info!(
        "starting glint proxy on {}:{}",
        config.listen_addr,
        config.listen_port
    );
    server.run().await
}
