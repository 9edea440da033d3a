use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch};
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::TlsSection;
use crate::device::Device;
use crate::twin::{TwinDocument, TwinSide};

/// Log entries returned by `GET /log` when `num` is absent.
const DEFAULT_LOG_PAGE: usize = 20;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(device: Arc<Device>) -> Router {
    Router::new()
        .route("/", get(status).patch(patch_status))
        .route("/log", get(query_log).post(add_note).delete(clear_log))
        .route("/time", patch(set_time))
        .with_state(device)
}

async fn status(State(device): State<Arc<Device>>) -> impl IntoResponse {
    Json(device.status().await)
}

#[derive(Deserialize)]
struct PatchBody {
    property: TwinDocument,
}

async fn patch_status(
    State(device): State<Arc<Device>>,
    Json(body): Json<PatchBody>,
) -> impl IntoResponse {
    if let Err(e) = device.apply_document(&body.property, TwinSide::Desired).await {
        warn!(error = %format!("{e:#}"), "local patch applied with errors");
    }
    Json(device.status().await)
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(default, with = "time::serde::rfc3339::option")]
    time: Option<OffsetDateTime>,
    num: Option<usize>,
}

async fn query_log(
    State(device): State<Arc<Device>>,
    Query(q): Query<LogQuery>,
) -> impl IntoResponse {
    let before = q.time.unwrap_or_else(OffsetDateTime::now_utc);
    let num = q.num.unwrap_or(DEFAULT_LOG_PAGE);
    let st = device.shared.read().await;
    Json(st.older_than(before, num))
}

#[derive(Deserialize)]
struct NoteBody {
    log: String,
}

async fn add_note(
    State(device): State<Arc<Device>>,
    Json(body): Json<NoteBody>,
) -> impl IntoResponse {
    if body.log.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    device.shared.write().await.record_note(body.log);
    StatusCode::CREATED
}

async fn clear_log(State(device): State<Arc<Device>>) -> impl IntoResponse {
    device.shared.write().await.reset_log();
    info!("local log cleared via api");
    StatusCode::NO_CONTENT
}

/// Unix milliseconds or an RFC 3339 string.
#[derive(Deserialize)]
#[serde(untagged)]
enum Timestamp {
    UnixMs(i64),
    #[serde(with = "time::serde::rfc3339")]
    Text(OffsetDateTime),
}

#[derive(Deserialize)]
struct TimeBody {
    timestamp: Timestamp,
}

async fn set_time(State(device): State<Arc<Device>>, Json(body): Json<TimeBody>) -> Response {
    let time = match body.timestamp {
        Timestamp::UnixMs(ms) => {
            match OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000) {
                Ok(t) => t,
                Err(_) => return StatusCode::BAD_REQUEST.into_response(),
            }
        }
        Timestamp::Text(t) => t,
    };
    // minute resolution
    let time = time
        .replace_second(0)
        .and_then(|t| t.replace_nanosecond(0))
        .unwrap_or(time);

    if device.set_clock {
        if let Err(e) = set_host_clock(time).await {
            warn!(error = %format!("{e:#}"), "clock update failed");
            device
                .shared
                .write()
                .await
                .record_error(format!("clock update failed: {e}"));
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let Ok(text) = time.format(&Rfc3339) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    info!(time = %text, "clock set via api");
    device
        .shared
        .write()
        .await
        .record_operation(format!("clock set to {text}"));
    Json(text).into_response()
}

async fn set_host_clock(time: OffsetDateTime) -> Result<()> {
    let status = Command::new("date")
        .arg("--utc")
        .arg(format!("--set=@{}", time.unix_timestamp()))
        .status()
        .await
        .context("running date")?;
    anyhow::ensure!(status.success(), "date exited with {status}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(device: Arc<Device>, port: u16, tls: Option<TlsSection>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(device);

    #[cfg(feature = "tls")]
    if let Some(tls) = tls {
        let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
            .await
            .with_context(|| format!("loading tls cert {} / key {}", tls.cert, tls.key))?;
        info!(%addr, "local api listening (tls)");
        axum_server::bind_rustls(addr, rustls)
            .serve(app.into_make_service())
            .await
            .context("web server error")?;
        return Ok(());
    }
    #[cfg(not(feature = "tls"))]
    if tls.is_some() {
        warn!("web.tls is set but this build has no tls support; serving plain http");
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;
    info!(%addr, "local api listening");
    axum::serve(listener, app).await.context("web server error")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
