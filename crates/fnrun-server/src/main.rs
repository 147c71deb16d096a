use anyhow::Context;
use fnrun_executor::{DockerRuntime, Engine, EngineConfig, FsCodeStore};
use fnrun_server::{create_app, AppState, ServerConfig};
use fnrun_store::JsonFileStore;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,fnrun=debug")),
        )
        .init();

    let server = ServerConfig::from_env()?;
    let config = EngineConfig::from_env()
        .await
        .context("loading engine configuration")?;

    let runtime = Arc::new(DockerRuntime::connect_local().context("connecting to Docker")?);
    let code = Arc::new(FsCodeStore::open(&config.functions_dir).await?);
    let store = Arc::new(
        JsonFileStore::open(&server.data_dir)
            .await
            .context("opening data directory")?,
    );
    let engine = Arc::new(Engine::new(config, runtime, code, store.clone(), store)?);

    let restored = engine.restore().await?;
    info!(functions = restored, "Restored function catalogue");
    match engine.sweep_stranded().await {
        Ok(0) => {}
        Ok(n) => warn!(removed = n, "Removed stranded sandboxes from a previous run"),
        Err(e) => warn!(error = %e, "Stranded sandbox sweep failed"),
    }

    let app = create_app(AppState::new(engine.clone()));
    let addr = server.addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("fnrun listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, removing leftover sandboxes");
    if let Err(e) = engine.sweep_stranded().await {
        warn!(error = %e, "Final sandbox sweep failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
