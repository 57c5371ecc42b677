// Broker service main entry point.
use anyhow::{Context, Result};
use clap::Parser;
use keybus_broker::{Hub, HubOptions};
use keybus_storage::MemoryBackend;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keybus-server", about = "WebSocket key-value broker")]
struct Args {
    /// host:port to listen on
    #[arg(long, default_value = ":8080")]
    port: String,

    /// password to use (leave blank for no password)
    #[arg(long, default_value = "")]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let (hub, handle) = Hub::new(
        MemoryBackend::new().into(),
        HubOptions {
            password: args.password,
        },
    );
    let hub_task = tokio::spawn(hub.run());

    let bind_addr = keybus_server::normalize_bind_addr(&args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "websocket listener started");

    let app = keybus_server::build_router(handle.clone());
    let serve_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            tracing::warn!(error = %err, "server loop exited");
        }
    });

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    handle.shutdown();
    serve_task.abort();
    let _ = hub_task.await;
    tracing::info!("broker stopped");
    Ok(())
}
