use std::sync::Arc;

use tokio::net::TcpListener;

use agent_dispatch::config::DispatcherConfig;
use agent_dispatch::dispatch::{self, Dispatcher, spawn_liveness_task};
use agent_dispatch::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatcherConfig::from_env()?;
    let port = config.port;

    eprintln!("📡 Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker WS: ws://0.0.0.0:{}/ws", port);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws/events", port);
    eprintln!("   Tasks API: http://0.0.0.0:{}/api/tasks", port);
    eprintln!(
        "   Heartbeat: every {}s, timeout {}s\n",
        config.heartbeat_interval.as_secs(),
        config.heartbeat_timeout.as_secs()
    );

    let dispatcher = Dispatcher::new(config);
    let monitor = spawn_liveness_task(Arc::clone(&dispatcher));

    // ── Shutdown on Ctrl-C ──────────────────────────────────────────────
    let ctrl_c_dispatcher = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
            ctrl_c_dispatcher.shutdown().await;
        }
    });

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Dispatch server listening");

    dispatch::serve(listener, Arc::clone(&dispatcher)).await?;

    // Covers the server exiting for any reason other than Ctrl-C.
    dispatcher.shutdown().await;
    let _ = monitor.await;

    tracing::info!("Dispatch server stopped");
    Ok(())
}
