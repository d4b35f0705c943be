use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use serde_json::json;

use crate::gateway::connection::{chat_gateway_upgrade, media_gateway_upgrade};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/gateway/chat", get(chat_gateway_upgrade))
        .route("/gateway/media", get(media_gateway_upgrade))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let workers = state.workers.views().await;
    Json(json!({
        "status": if state.workers.live_count() > 0 { "ok" } else { "degraded" },
        "workers": workers.iter().map(|w| json!({
            "slot": w.slot,
            "pid": w.pid,
            "online": w.online,
            "routers": w.routers,
            "transports": w.transports,
            "score": if w.score.is_finite() { json!(w.score) } else { json!(null) },
        })).collect::<Vec<_>>(),
        "rooms": state.rooms.room_count(),
        "connections": state.gateway.connection_count(),
        "queues": state.queues.queue_count(),
        "tapSessions": state.sidetap.session_count(),
        "tapPortsFree": state.sidetap.ports_available(),
    }))
}
