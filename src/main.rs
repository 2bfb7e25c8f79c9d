use std::sync::Arc;

use mesh_voice::{
    config::{Config, ROOM_CAPACITY},
    directory::{Directory, HttpDirectory},
    error::{config, AppErr},
    routes,
    state::RoomRegistry,
    utils::stats,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppErr> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg   = Config::from_env()?;
    let rooms = RoomRegistry::shared(ROOM_CAPACITY);
    let dir: Directory = Arc::new(HttpDirectory::new(&cfg.api_base, cfg.directory_timeout).map_err(config)?);

    tokio::spawn(stats::task(rooms.clone(), cfg.stats_interval));  // 定期統計

    let app = routes::app(&cfg.jwt_secret, &cfg.cors_origin, rooms, dir)?;

    let listener = tokio::net::TcpListener::bind(cfg.addr).await?;
    info!(addr = %cfg.addr, api_base = %cfg.api_base, "signaling relay listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown())
        .await?;
    info!("server closed");
    Ok(())
}

async fn shutdown() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => { s.recv().await; }
            Err(_)    => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term   => {},
    }
    info!("shutdown signal received, shutting down gracefully");
}
