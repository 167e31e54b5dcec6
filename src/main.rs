use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod services;
mod store;

use config::BridgeConfig;
use services::{Bridge, ChatOutcome, Monitor, INTERNAL_ERROR_REPLY};

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    bridge: Arc<Bridge>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    sender_id: String,
    message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatResponse {
    reply: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match BridgeConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            error!(%error, "invalid bridge configuration");
            std::process::exit(1);
        }
    };

    let bridge = Arc::new(Bridge::new(&config));
    info!(
        inbound = %config.inbound_path.display(),
        claude_config = %config.claude_config_path.display(),
        reply = %config.reply_path.display(),
        project = %config.project_key,
        "claude bridge started"
    );

    let monitor = if config.monitor_enabled {
        Some(Monitor::new(bridge.clone(), config.monitor_poll_interval).spawn())
    } else {
        info!("inbound file monitor disabled by BRIDGE_DISABLE_MONITOR");
        None
    };

    let state = Arc::new(AppState {
        started_at: Instant::now(),
        bridge: bridge.clone(),
    });
    let app = app_router(state);

    let bind_addr = config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, bind_addr = %bind_addr, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(
        bind_addr = %bind_addr,
        "listening: POST /api/whatsapp-chat, GET /api/test, GET /api/status"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(bridge.clone()))
        .await;

    bridge.stop();
    if let Some(monitor) = monitor {
        let _ = monitor.await;
    }

    if let Err(error) = served {
        error!(%error, "server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal(bridge: Arc<Bridge>) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, stopping bridge");
    bridge.stop();
}

fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/whatsapp-chat", post(chat_handler))
        .route("/api/test", get(test_handler))
        .route("/api/status", get(status_handler))
        .fallback(not_found_handler)
        .method_not_allowed_fallback(not_found_handler)
        .with_state(state)
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "invalid chat payload");
            return internal_error_response();
        }
    };

    let bridge = state.bridge.clone();
    let handled = tokio::spawn(async move {
        bridge
            .handle_chat(&request.sender_id, &request.message)
            .await
    })
    .await;

    let outcome = match handled {
        Ok(outcome) => outcome,
        Err(error) => {
            error!(%error, "chat handler task failed");
            return internal_error_response();
        }
    };

    let status = match &outcome {
        ChatOutcome::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::OK,
    };
    if let ChatOutcome::Replied(reply) = &outcome {
        info!(reply = %reply, "sending reply to whatsapp");
    }

    (
        status,
        Json(ChatResponse {
            reply: outcome.into_reply(),
        }),
    )
        .into_response()
}

async fn test_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "Claude Bridge ativo!",
        "timestamp": now_iso(),
        "claude_config_exists": state.bridge.files().claude_config.exists(),
        "message": "Sistema pronto para integração com Claude Code",
    }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "bridge_running": state.bridge.is_running(),
        "last_processed_id": state.bridge.last_processed_id().await,
        "files_status": state.bridge.files().status(),
        "stats": state.bridge.stats(),
        "uptime_sec": state.started_at.elapsed().as_secs(),
    }))
}

async fn not_found_handler() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "not_found",
            "message": "Endpoint não encontrado",
        })),
    )
        .into_response()
}

fn internal_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ChatResponse {
            reply: INTERNAL_ERROR_REPLY.to_string(),
        }),
    )
        .into_response()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::RootDir | Component::Prefix(_) | Component::Normal(_) => {
                normalized.push(component.as_os_str());
            }
        }
    }

    normalized
}
