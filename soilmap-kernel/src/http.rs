/**
 * API REST SOILMAP - Surface HTTP du kernel
 *
 * RÔLE :
 * Expose la carte headless (markers, advisory, viewport) et les actions opérateur.
 *
 * FONCTIONNEMENT :
 * - Lectures : directement depuis `ViewMap` (état partagé, jamais bloquant)
 * - Actions : envoyées à la boucle de sync comme `Command` avec réponse oneshot,
 *   timeout 5s côté HTTP
 * - Header x-api-key exigé si SOILMAP_API_KEY est défini (sauf /health)
 */

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use soilmap_kernel::advisory::{AdvisoryError, AdvisoryPanel, AdvisoryState};
use soilmap_kernel::health::{HealthTracker, KernelHealth};
use soilmap_kernel::map::{Viewport, ViewportChange, ViewMap};
use soilmap_kernel::markers::Marker;
use soilmap_kernel::models::{Coordinates, Parameter};
use soilmap_kernel::sync::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::warn;

const API_KEY_ENV: &str = "SOILMAP_API_KEY";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

type ApiError = (StatusCode, Json<Value>);

fn api_error(code: StatusCode, msg: impl ToString) -> ApiError {
    (code, Json(json!({ "ok": false, "error": msg.to_string() })))
}

fn advisory_error(e: AdvisoryError) -> ApiError {
    let code = match &e {
        AdvisoryError::UnknownMarker(_) => StatusCode::NOT_FOUND,
        AdvisoryError::NotOpen
        | AdvisoryError::AffordanceDisabled { .. }
        | AdvisoryError::NoPacket(_)
        | AdvisoryError::WriteInFlight => StatusCode::CONFLICT,
        AdvisoryError::Write(_) => StatusCode::BAD_GATEWAY,
    };
    api_error(code, e)
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!(path = %req.uri().path(), "rejected request: bad or missing x-api-key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub map: ViewMap,
    pub commands: mpsc::Sender<Command>,
    pub health: HealthTracker,
}

impl AppState {
    /// Envoie une commande à la boucle de sync et attend sa réponse
    async fn dispatch<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ApiError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| api_error(StatusCode::SERVICE_UNAVAILABLE, "sync loop stopped"))?;

        match timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "command dropped")),
            Err(_) => Err(api_error(StatusCode::GATEWAY_TIMEOUT, "command timed out")),
        }
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/markers", get(list_markers))
        .route("/markers/{id}", get(get_marker))
        .route("/markers/{id}/toggle", post(toggle_extra))
        .route("/advisory", get(get_advisory))
        .route("/advisory/open", post(open_advisory))
        .route("/advisory/acknowledge", post(acknowledge))
        .route("/viewport", get(get_viewport).post(set_viewport))
        .route("/map/click", post(map_click))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health())
}

// GET /markers
async fn list_markers(State(app): State<AppState>) -> Json<Vec<Marker>> {
    Json(app.map.markers())
}

// GET /markers/{id}
async fn get_marker(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Marker>, StatusCode> {
    app.map.marker(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// POST /markers/{id}/toggle (lignes 5 à 8)
async fn toggle_extra(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let expanded = app
        .dispatch(|reply| Command::ToggleExtra {
            marker: id.clone(),
            reply,
        })
        .await?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown marker: {id}")))?;
    Ok(Json(json!({ "ok": true, "extras_expanded": expanded })))
}

// GET /advisory
async fn get_advisory(State(app): State<AppState>) -> Json<Option<AdvisoryPanel>> {
    Json(app.map.advisory())
}

#[derive(Debug, Deserialize)]
struct OpenAdvisoryBody {
    marker_id: String,
    parameter: String,
}

// POST /advisory/open
async fn open_advisory(
    State(app): State<AppState>,
    Json(body): Json<OpenAdvisoryBody>,
) -> Result<Json<AdvisoryState>, ApiError> {
    let parameter: Parameter = body
        .parameter
        .parse()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    app.dispatch(|reply| Command::OpenAdvisory {
        marker: body.marker_id,
        parameter,
        reply,
    })
    .await?
    .map(Json)
    .map_err(advisory_error)
}

// POST /advisory/acknowledge (bouton "Done")
async fn acknowledge(State(app): State<AppState>) -> Result<Json<Value>, ApiError> {
    app.dispatch(|reply| Command::Acknowledge { reply })
        .await?
        .map_err(advisory_error)?;
    Ok(Json(json!({ "ok": true })))
}

// GET /viewport
async fn get_viewport(State(app): State<AppState>) -> Json<Viewport> {
    Json(app.map.viewport())
}

#[derive(Debug, Deserialize)]
struct ViewportBody {
    center_lng: f64,
    center_lat: f64,
    zoom: f64,
    width: f64,
    height: f64,
    kind: ViewportChange,
}

// POST /viewport (move / zoom du client)
async fn set_viewport(
    State(app): State<AppState>,
    Json(body): Json<ViewportBody>,
) -> Result<StatusCode, ApiError> {
    if body.width <= 0.0 || body.height <= 0.0 || !body.zoom.is_finite() {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid viewport"));
    }
    app.map.set_viewport(Viewport {
        center: Coordinates {
            x: body.center_lng,
            y: body.center_lat,
        },
        zoom: body.zoom,
        width: body.width,
        height: body.height,
    });
    // repositionnement de l'advisory fait par la boucle
    app.commands
        .send(Command::Viewport(body.kind))
        .await
        .map_err(|_| api_error(StatusCode::SERVICE_UNAVAILABLE, "sync loop stopped"))?;
    Ok(StatusCode::ACCEPTED)
}

// POST /map/click
async fn map_click(State(app): State<AppState>) -> Result<StatusCode, ApiError> {
    app.commands
        .send(Command::MapClick)
        .await
        .map_err(|_| api_error(StatusCode::SERVICE_UNAVAILABLE, "sync loop stopped"))?;
    Ok(StatusCode::ACCEPTED)
}
