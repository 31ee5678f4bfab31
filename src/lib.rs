pub mod api; // HTTP gateway
pub mod authorization;
pub mod catalog; // Versioned test definitions
pub mod config;
pub mod core_state; // Shared state: config, order locks, audit buffer
pub mod db;
pub mod lifecycle; // Order state machine + worklists
pub mod models;
pub mod patients; // Patient registry
pub mod validator; // Range parsing + result flagging

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Core(#[from] core_state::CoreError),
    #[error(transparent)]
    Server(#[from] api::ServerError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Start the server and block until Ctrl-C.
pub fn run() -> Result<(), StartupError> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("LIS starting v{}", config::APP_VERSION);

    let config = config::ServerConfig::from_env()?;
    let bind_addr = config.bind_addr;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        policy = config.approval_policy.as_str(),
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let core = Arc::new(core_state::CoreState::open(config)?);
        let server = api::start_api_server(core, bind_addr).await?;

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C; shutting down");
        }
        tracing::info!("Shutdown requested");
        server.shutdown().await?;
        Ok(())
    })
}
