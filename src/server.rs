//! ==============================================================================
//! server.rs - live snapshot api
//! ==============================================================================
//!
//! purpose:
//!     read-only json view of the latest published snapshot for dashboards.
//!
//! routes:
//!     GET /api          -> latest snapshot (503 until the first cycle publishes)
//!     GET /api/summary  -> snapshot + aqi/uv/humidity bands + sun times + daytime
//!
//! handlers only clone the Arc out of the snapshot channel; nothing here
//! touches the bus or the filesystem.
//!
//! ==============================================================================

use anyhow::{anyhow, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::almanac::{SunAlmanac, SunTimes};
use crate::metrics::{aqi_band, humidity_band, uv_band, Band};
use crate::snapshot::{Snapshot, SnapshotReader};

#[derive(Clone)]
pub struct ApiState {
    pub snapshots: SnapshotReader,
    pub almanac: Arc<SunAlmanac>,
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub snapshot: Snapshot,
    /// display unit, derived from m/s
    pub wind_speed_kmh: Option<f64>,
    pub aqi_band: Band,
    pub uv_band: Band,
    pub humidity_band: Band,
    pub sun: SunTimes,
    pub daytime: bool,
}

pub fn summarize(snapshot: &Snapshot, almanac: &SunAlmanac) -> Summary {
    let local = snapshot.captured_at.naive_local();
    Summary {
        snapshot: snapshot.clone(),
        wind_speed_kmh: snapshot.wind_speed.map(|ms| ms * 3.6),
        aqi_band: aqi_band(snapshot.aqi),
        uv_band: uv_band(snapshot.uv_index),
        humidity_band: humidity_band(snapshot.humidity),
        sun: almanac.lookup(local.date()),
        daytime: almanac.is_daytime(local),
    }
}

pub async fn run_server(
    bind: &str,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = Router::new()
        .route("/api", get(api_handler))
        .route("/api/summary", get(summary_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow!("Failed to bind api server to {}: {}", bind, e))?;
    tracing::info!(bind, "api server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    tracing::info!("api server stopped");
    Ok(())
}

/// latest snapshot as json
async fn api_handler(State(state): State<ApiState>) -> Result<Json<Snapshot>, StatusCode> {
    let latest = state.snapshots.latest().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(Snapshot::clone(&latest)))
}

async fn summary_handler(State(state): State<ApiState>) -> Result<Json<Summary>, StatusCode> {
    let latest = state.snapshots.latest().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(summarize(&latest, &state.almanac)))
}
