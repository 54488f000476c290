use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as UrlPath, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{
    services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer,
};
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    error::ScanError,
    events::{ClientEvent, ResumeScanRequest, ServerEvent},
    export,
    prober::TcpProber,
    registry::SessionRegistry,
    session::EventSender,
};

#[derive(Clone)]
pub struct AppState {
    registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

pub async fn spawn_server(config: ServerConfig) -> Result<()> {
    let registry = Arc::new(SessionRegistry::new(Arc::new(TcpProber), config.retention));
    spawn_sweeper(registry.clone(), config.sweep_interval);

    let app = router(AppState::new(registry), &config.ui_dir);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!("serving UI and event stream on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Routes:
/// - `GET /ws` event connection
/// - `GET /export/{sid}` CSV of a session's open ports
/// - `GET /api/status/{sid}` JSON snapshot of a session
/// - `GET /health`
/// - anything else is served from `ui_dir`
pub fn router(state: AppState, ui_dir: &Path) -> Router {
    let api = Router::new()
        .route("/status/{sid}", get(get_status))
        .with_state(state.clone());

    let static_svc = ServeDir::new(ui_dir).append_index_html_on_directories(true);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/export/{sid}", get(get_export))
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
        .fallback_service(static_svc)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("no-store"),
                )),
        )
}

fn spawn_sweeper(registry: Arc<SessionRegistry>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            registry.evict_expired().await;
        }
    });
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn get_status(State(app): State<AppState>, UrlPath(sid): UrlPath<String>) -> Response {
    match app.registry.lookup(&sid).await {
        Ok(session) => (StatusCode::OK, Json(session.snapshot())).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "kind": e.kind(), "message": e.to_string() })))
            .into_response(),
    }
}

async fn get_export(State(app): State<AppState>, UrlPath(sid): UrlPath<String>) -> Response {
    let session = match app.registry.lookup(&sid).await {
        Ok(s) => s,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };
    match export::export_session(&session) {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename={}", export::export_filename(&sid)),
                ),
            ],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(session = %sid, error = %e, "export failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "export failed").into_response()
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(mut socket: WebSocket, app: AppState) {
    let sid = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ = tx.send(ServerEvent::Connected { sid: sid.clone() });
    tracing::info!(session = %sid, "client connected");

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                let text = match serde_json::to_string(&event) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!(session = %sid, event = event.name(), error = %e, "failed to encode event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = dispatch(&app, &sid, &tx, text.as_str()).await {
                        tracing::debug!(session = %sid, error = %e, "request rejected");
                        let _ = tx.send(ServerEvent::error(&e));
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    app.registry.detach(&sid).await;
    tracing::info!(session = %sid, "client disconnected");
}

/// Apply one client frame to the connection's session.
pub async fn dispatch(
    app: &AppState,
    sid: &str,
    events: &EventSender,
    text: &str,
) -> Result<(), ScanError> {
    match ClientEvent::parse(text)? {
        ClientEvent::StartScan(req) if req.resume => {
            let resume = ResumeScanRequest {
                threads: Some(req.threads),
                timeout: Some(req.timeout),
            };
            app.registry.resume_scan(sid, &resume).await
        }
        ClientEvent::StartScan(req) => app
            .registry
            .start_scan(sid, events.clone(), &req)
            .await
            .map(|_| ()),
        ClientEvent::ResumeScan(req) => app.registry.resume_scan(sid, &req).await,
        ClientEvent::StopScan => app.registry.stop_scan(sid).await,
    }
}
