//! REST facade over the supervisor.
//!
//! Exposes `GET`/`POST /api/streams` and `DELETE /api/streams/{id}` on a
//! dedicated thread running a current-thread tokio runtime; the casting
//! core stays purely thread-based. Blocking supervisor calls run on the
//! runtime's blocking pool.

use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::caster::Caster;
use crate::error::{Error, Result};
use crate::stream::{Endpoint, StreamStatus};

/// `POST /api/streams` request body.
#[derive(Debug, Deserialize)]
struct CreateStreamRequest {
    source: String,
    endpoint: Endpoint,
}

/// `GET /api/streams` response body.
#[derive(Debug, Serialize)]
struct ListStreamsResponse {
    streams: Vec<StreamStatus>,
}

/// Error wrapper mapping supervisor errors to HTTP statuses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::StreamNotFound(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn router(caster: Arc<Caster>) -> Router {
    Router::new()
        .route("/api/streams", get(list_streams).post(create_stream))
        .route("/api/streams/:id", axum::routing::delete(delete_stream))
        .with_state(caster)
}

async fn list_streams(State(caster): State<Arc<Caster>>) -> Json<ListStreamsResponse> {
    Json(ListStreamsResponse {
        streams: caster.list_streams(),
    })
}

async fn create_stream(
    State(caster): State<Arc<Caster>>,
    Json(request): Json<CreateStreamRequest>,
) -> std::result::Result<Json<StreamStatus>, ApiError> {
    let status = tokio::task::spawn_blocking(move || {
        caster.create_stream(&request.source, request.endpoint)
    })
    .await
    .map_err(|_| Error::Internal("create task failed".into()))??;
    Ok(Json(status))
}

async fn delete_stream(
    State(caster): State<Arc<Caster>>,
    Path(id): Path<u32>,
) -> std::result::Result<StatusCode, ApiError> {
    tokio::task::spawn_blocking(move || caster.delete_stream(id, false))
        .await
        .map_err(|_| Error::Internal("delete task failed".into()))??;
    Ok(StatusCode::OK)
}

/// Handle to the running REST server thread.
pub struct ApiServer {
    local_addr: SocketAddr,
    _thread: JoinHandle<()>,
}

impl ApiServer {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Bind `addr` and serve the REST API on a background thread.
///
/// Returns once the listener is bound, so bind failures surface here as
/// fatal initialization errors.
pub fn spawn(caster: Arc<Caster>, addr: SocketAddr) -> Result<ApiServer> {
    let (ready_tx, ready_rx) = mpsc::channel::<Result<SocketAddr>>();

    let thread = std::thread::Builder::new().name("api".into()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
        };

        runtime.block_on(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            let local_addr = match listener.local_addr() {
                Ok(local_addr) => local_addr,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(local_addr));

            if let Err(e) = axum::serve(listener, router(caster)).await {
                tracing::error!(error = %e, "REST server stopped");
            }
        });
    })?;

    let local_addr = ready_rx
        .recv()
        .map_err(|_| Error::Internal("REST server thread died before binding".into()))??;

    tracing::debug!(addr = %local_addr, "REST API listening");
    Ok(ApiServer {
        local_addr,
        _thread: thread,
    })
}
