use std::path::PathBuf;

use clap::Parser;
use embed_http_core::ServerConfig;
use embed_http_demo::DemoApp;
use tracing::info;

#[derive(Parser)]
#[command(name = "embed-http-demo", about = "Embedded HTTP server demo", version)]
struct Cli {
    /// Port to listen on (0 picks a free port).
    #[arg(long, default_value = "8080")]
    port: u16,

    /// TOML file with server settings.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,embed_http_core=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    let mut app = DemoApp::new(config)?;
    let addr = app.start(cli.port).await?;
    info!(%addr, "try: curl http://{addr}/ping");

    tokio::signal::ctrl_c().await?;
    info!(pending = app.pending_count(), "shutting down");
    app.stop().await?;
    Ok(())
}
