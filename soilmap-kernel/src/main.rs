/**
 * SOILMAP KERNEL - Point d'entrée du serveur
 *
 * RÔLE : config, store MQTT, validation de l'identité opérateur, boucle de sync, HTTP.
 * Une identité inconnue arrête le démarrage : rien n'est rendu.
 */

mod http;

use anyhow::{Context, Result};
use soilmap_kernel::config::{load_config, ADMIN_ENV};
use soilmap_kernel::health::HealthTracker;
use soilmap_kernel::map::{Viewport, ViewMap};
use soilmap_kernel::store::mqtt::MqttStore;
use soilmap_kernel::sync::TelemetrySyncController;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("soilmap_kernel=info")),
        )
        .init();

    let cfg = load_config().await.context("Failed to load kernel config")?;
    let identity = cfg
        .operator_identity(std::env::var(ADMIN_ENV).ok())
        .context("Failed to resolve operator identity")?;

    let health = HealthTracker::new();
    let store = Arc::new(MqttStore::connect(&cfg.mqtt, health.clone()));
    let map = ViewMap::new(Viewport::default());

    let mut controller = TelemetrySyncController::new(store, map.clone(), cfg.sync_settings(), health.clone());
    if let Err(e) = controller.validate_identity(&identity).await {
        error!("startup aborted: {e}");
        return Err(e).context("Operator identity check failed");
    }
    let snapshots = controller
        .open_subscription()
        .await
        .context("Failed to subscribe to Users")?;

    let (commands, command_rx) = mpsc::channel(32);
    let app = http::build_router(http::AppState {
        map,
        commands,
        health,
    });

    let listener = TcpListener::bind(cfg.http.bind.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", cfg.http.bind))?;
    info!("listening on http://{}", cfg.http.bind);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server stopped: {e}");
        }
    });

    controller.run(snapshots, command_rx).await.context("Sync loop stopped")
}
