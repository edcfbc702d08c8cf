use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use ws_echo::config::Config;
use ws_echo::server::Server;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        page = %config.page.display(),
        workers = ?config.workers,
        read_buffer_size = config.read_buffer_size,
        write_buffer_size = config.write_buffer_size,
        "Starting ws-echo server"
    );

    if config.allow_any_origin {
        warn!("Accepting WebSocket upgrades from any origin");
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let result = runtime.block_on(run(config));
    if let Err(ref e) = result {
        error!(error = %e, "Server failed");
    }
    result
}

/// Run the server until Ctrl+C
async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(config);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, shutting down");
        shutdown.cancel();
    });

    server.run().await
}
