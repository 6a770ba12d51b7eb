use std::path::PathBuf;

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, Method, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use harbor_process::{ProxyRequest, StartOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    commands::Launcher,
    config::{LauncherConfig, format_error_chain},
    supervisor::StartError,
};

const DEFAULT_LOG_LIMIT: usize = 200;
const MAX_LOG_LIMIT: usize = 2000;

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorBody {
            message: message.into(),
            kind: None,
        }),
    )
        .into_response()
}

fn start_error(err: StartError) -> Response {
    let (code, kind) = match &err {
        StartError::NoFreePort { .. } => (StatusCode::CONFLICT, "no_free_port"),
        StartError::Spawn(_) => (StatusCode::INTERNAL_SERVER_ERROR, "spawn_failed"),
        StartError::ExitedBeforeReady { .. } => (StatusCode::BAD_GATEWAY, "exited_before_ready"),
        StartError::Monitor(_) => (StatusCode::INTERNAL_SERVER_ERROR, "monitor_failed"),
    };
    (
        code,
        Json(ErrorBody {
            message: err.to_string(),
            kind: Some(kind),
        }),
    )
        .into_response()
}

fn internal(err: anyhow::Error) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format_error_chain(&err))
}

fn origin_is_local(headers: &HeaderMap) -> bool {
    // Missing Origin means a non-browser client.
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    reqwest::Url::parse(origin).is_ok_and(|u| {
        matches!(
            u.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]")
        )
    })
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

// State-changing calls and event subscriptions from web pages on other origins are
// refused. WebSocket handshakes are plain GETs that CORS does not cover.
async fn local_origin_only(req: Request<Body>, next: Next) -> Response {
    let unsafe_method = matches!(
        *req.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    let guarded = unsafe_method || is_websocket_upgrade(req.headers());
    if guarded && !origin_is_local(req.headers()) {
        return json_error(StatusCode::FORBIDDEN, "origin not allowed");
    }
    next.run(req).await
}

#[derive(Debug, Default, Deserialize)]
struct RootQuery {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageQuery {
    name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    cursor: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenBody {
    url: Option<String>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn install_runtime(State(launcher): State<Launcher>, Query(q): Query<RootQuery>) -> Response {
    match launcher.install_runtime(q.path.as_deref()).await {
        Ok(installed) => Json(serde_json::json!({ "installed": installed })).into_response(),
        Err(e) => json_error(StatusCode::BAD_GATEWAY, format_error_chain(&e)),
    }
}

async fn runtime_status(State(launcher): State<Launcher>, Query(q): Query<RootQuery>) -> Response {
    let installed = launcher.runtime_status(q.path.as_deref()).await;
    Json(serde_json::json!({ "installed": installed })).into_response()
}

async fn uninstall_runtime(
    State(launcher): State<Launcher>,
    Query(q): Query<RootQuery>,
) -> Response {
    let removed = launcher.uninstall_runtime(q.path.as_deref()).await;
    Json(serde_json::json!({ "removed": removed })).into_response()
}

async fn install_package(
    State(launcher): State<Launcher>,
    Query(q): Query<PackageQuery>,
) -> Response {
    match launcher
        .install_package(q.name.as_deref(), q.version.as_deref())
        .await
    {
        Ok(installed) => Json(serde_json::json!({ "installed": installed })).into_response(),
        Err(e) => internal(e),
    }
}

async fn package_status(State(launcher): State<Launcher>, Query(q): Query<PackageQuery>) -> Response {
    Json(launcher.package_status(q.name.as_deref()).await).into_response()
}

async fn start_server(
    State(launcher): State<Launcher>,
    options: Option<Json<StartOptions>>,
) -> Response {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    match launcher.start_server(options).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => start_error(e),
    }
}

async fn stop_server(State(launcher): State<Launcher>) -> Response {
    let stopped = launcher.stop_server().await;
    Json(serde_json::json!({ "stopped": stopped })).into_response()
}

async fn restart_server(State(launcher): State<Launcher>) -> Response {
    match launcher.restart_server().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => start_error(e),
    }
}

async fn server_info(State(launcher): State<Launcher>) -> Response {
    Json(launcher.server_info().await).into_response()
}

async fn server_logs(State(launcher): State<Launcher>, Query(q): Query<LogsQuery>) -> Response {
    let limit = q
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .min(MAX_LOG_LIMIT);
    Json(launcher.server_logs(q.cursor.unwrap_or(0), limit).await).into_response()
}

async fn proxy(State(launcher): State<Launcher>, Json(req): Json<ProxyRequest>) -> Response {
    Json(launcher.proxy(req).await).into_response()
}

async fn quick_chat_info(State(launcher): State<Launcher>) -> Response {
    Json(launcher.quick_chat_info().await).into_response()
}

async fn get_config(State(launcher): State<Launcher>) -> Response {
    Json(launcher.config().await).into_response()
}

async fn put_config(
    State(launcher): State<Launcher>,
    Json(cfg): Json<LauncherConfig>,
) -> Response {
    match launcher.set_config(cfg).await {
        Ok(cfg) => Json(cfg).into_response(),
        Err(e) => json_error(StatusCode::BAD_REQUEST, format_error_chain(&e)),
    }
}

async fn open_in_browser(
    State(launcher): State<Launcher>,
    body: Option<Json<OpenBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    match launcher.open_in_browser(body.url.as_deref()).await {
        Ok(url) => Json(serde_json::json!({ "url": url })).into_response(),
        Err(e) => json_error(StatusCode::BAD_REQUEST, format_error_chain(&e)),
    }
}

async fn reset(State(launcher): State<Launcher>) -> Response {
    match launcher.reset().await {
        Ok(()) => Json(serde_json::json!({ "reset": true })).into_response(),
        Err(e) => internal(e),
    }
}

async fn events(State(launcher): State<Launcher>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(launcher, socket))
}

async fn stream_events(launcher: Launcher, socket: WebSocket) {
    let mut events = launcher.subscribe();
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(ev) => {
                    let Ok(text) = serde_json::to_string(&ev) else { continue };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

pub fn router(launcher: Launcher) -> Router {
    let api = Router::new()
        .route("/runtime/install", post(install_runtime))
        .route("/runtime/status", get(runtime_status))
        .route("/runtime/uninstall", post(uninstall_runtime))
        .route("/package/install", post(install_package))
        .route("/package/status", get(package_status))
        .route("/server/start", post(start_server))
        .route("/server/stop", post(stop_server))
        .route("/server/restart", post(restart_server))
        .route("/server/info", get(server_info))
        .route("/server/logs", get(server_logs))
        .route("/proxy", post(proxy))
        .route("/quickchat/info", get(quick_chat_info))
        .route("/config", get(get_config).put(put_config))
        .route("/open", post(open_in_browser))
        .route("/reset", post(reset))
        .route("/events", get(events));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(middleware::from_fn(local_origin_only))
        .with_state(launcher)
}
