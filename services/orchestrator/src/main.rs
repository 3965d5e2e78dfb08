use tracing::info;
use tracing_subscriber::EnvFilter;

use orchestrator::config::Config;
use orchestrator::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    info!(name = %config.name, msg_port = config.msg_port, "starting orchestrator");

    let supervisor = Supervisor::new(&config, tokio::runtime::Handle::current());
    supervisor.start(&config).expect("failed to start gateway transport");

    let router = orchestrator::build_router(supervisor);
    let listener = tokio::net::TcpListener::bind(&config.control_api_bind_addr)
        .await
        .expect("failed to bind control API listener");
    info!(addr = %config.control_api_bind_addr, "control API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("control API server error");
    info!("orchestrator shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
