use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

pub mod app;
pub mod config;
pub mod events;
pub mod process;
pub mod registry;
pub mod run;
pub mod session;
pub mod store;
pub mod transport;

use app::{build_router, AppState};
use config::Settings;
use registry::AgentRegistry;
use run::RunManager;
use session::SessionManager;
use store::SessionStore;

pub async fn run_server(
    settings: Settings,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = Arc::new(AgentRegistry::load(&settings.agents_config)?);
    let store = Arc::new(SessionStore::open(&settings.db_path)?);
    let sessions = SessionManager::new(
        registry.clone(),
        store.clone(),
        settings.workdir.clone(),
        settings.terminate_grace,
        settings.idle_timeout,
    );
    let sweeper = sessions.spawn_sweeper();
    let runs = RunManager::new(registry.clone(), store.clone(), sessions.clone());

    let state = Arc::new(AppState {
        registry,
        store,
        sessions: sessions.clone(),
        runs,
        auth_token: settings.auth_token.clone(),
    });
    let router = build_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.bind_addr, settings.bind_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, auth = settings.auth_token.is_some(), "acp2-bridge listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await?;
    sweeper.abort();
    Ok(())
}

async fn shutdown_signal(sessions: Arc<SessionManager>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down, terminating agent processes");
    sessions.shutdown().await;
}
