use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Outbound, SocketId, chat, media};
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::state::AppState;
use crate::types::events::{AUTH_FAILED, AUTH_TIMEOUT, AuthErrorPayload, AuthPayload, Frame};

#[derive(Debug, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    #[serde(default, rename = "walletType")]
    pub wallet_type: Option<String>,
}

pub fn validate_token(config: &AppConfig, token: &str) -> Result<JwtClaims, GatewayError> {
    let data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(config.auth.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| GatewayError::AuthFailed)?;
    if data.claims.sub.is_empty() {
        return Err(GatewayError::AuthFailed);
    }
    Ok(data.claims)
}

// ── Chat namespace ─────────────────────────────────────

pub async fn chat_gateway_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> impl IntoResponse {
    let token = params
        .get("token")
        .cloned()
        .or_else(|| bearer.map(|TypedHeader(auth)| auth.token().to_string()));
    ws.on_upgrade(move |socket| handle_chat_connection(state, socket, token))
}

/// Token-validated handshake with a hard auth timeout, single-socket
/// enforcement, and room auto-join from the jobs service.
pub async fn handle_chat_connection(state: AppState, socket: WebSocket, token: Option<String>) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let socket_id: SocketId = Uuid::new_v4().to_string();

    let sender_task = spawn_sender(ws_sender, rx);
    state.gateway.register(&socket_id, tx.clone());

    let handshake = tokio::time::timeout(
        Duration::from_secs(state.config.auth.handshake_timeout_secs),
        async {
            let token = match token {
                Some(token) => token,
                None => wait_for_auth_frame(&mut ws_receiver)
                    .await
                    .ok_or(GatewayError::AuthFailed)?,
            };
            validate_token(&state.config, &token).map(|claims| (token, claims))
        },
    )
    .await;

    let (token, claims) = match handshake {
        Ok(Ok(authenticated)) => authenticated,
        Ok(Err(_)) => {
            deny(&state, &socket_id, &tx, AUTH_FAILED, "Authentication failed").await;
            drop(tx);
            let _ = sender_task.await;
            return;
        }
        Err(_) => {
            deny(&state, &socket_id, &tx, AUTH_TIMEOUT, "Authentication timed out").await;
            drop(tx);
            let _ = sender_task.await;
            return;
        }
    };

    let user_id = claims.sub.clone();
    state.gateway.set_identity(&socket_id, &user_id, None);

    // Single-socket invariant: evict every older socket for this user,
    // cluster-wide, before this one goes live.
    match state.sessions.bind(&user_id, &socket_id).await {
        Ok(stale) => {
            if !stale.is_empty() {
                state.gateway.disconnect_sockets(&stale);
                for old in &stale {
                    if let Err(e) = state.sessions.unbind(old).await {
                        tracing::warn!(socket_id = %old, error = %e, "Stale socket unbind failed");
                    }
                }
            }
        }
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Session bind failed");
            let _ = tx.send(Outbound::Close);
            cleanup_chat(&state, &socket_id).await;
            drop(tx);
            let _ = sender_task.await;
            return;
        }
    }

    // Auto-join the user's conversations; the jobs service is authoritative
    // and its failure is fatal for this connection.
    match state.jobs.fetch_job_ids(&token).await {
        Ok(rooms) => {
            if let Err(e) = state.sessions.add_rooms(&user_id, &rooms).await {
                tracing::warn!(user_id = %user_id, error = %e, "Persisting room list failed");
            }
            for room in &rooms {
                state.gateway.join_room(room, &socket_id);
            }
            tracing::info!(user_id = %user_id, socket_id = %socket_id, rooms = rooms.len(),
                "Chat client connected");
        }
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Jobs service lookup failed");
            let _ = tx.send(Outbound::Close);
            cleanup_chat(&state, &socket_id).await;
            drop(tx);
            let _ = sender_task.await;
            return;
        }
    }

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let frame: Frame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        let ack_id = frame.ack;
        let ack = chat::handle_event(&state, &socket_id, &user_id, frame).await;
        if let (Some(ack_id), Some(payload)) = (ack_id, ack) {
            state.gateway.send_to_socket(&socket_id, Frame::ack(ack_id, payload));
        }
    }

    cleanup_chat(&state, &socket_id).await;
    sender_task.abort();
    tracing::info!(user_id = %user_id, socket_id = %socket_id, "Chat client disconnected");
}

async fn cleanup_chat(state: &AppState, socket_id: &SocketId) {
    state.gateway.unregister(socket_id);
    if let Err(e) = state.sessions.unbind(socket_id).await {
        tracing::warn!(socket_id = %socket_id, error = %e, "Session unbind failed");
    }
}

async fn deny(
    state: &AppState,
    socket_id: &SocketId,
    tx: &mpsc::UnboundedSender<Outbound>,
    code: &'static str,
    message: &str,
) {
    let _ = tx.send(Outbound::Frame(Frame::event(
        "error:auth",
        AuthErrorPayload {
            error: message.to_string(),
            code,
        },
    )));
    let _ = tx.send(Outbound::Close);
    state.gateway.unregister(socket_id);
}

async fn wait_for_auth_frame(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => return None,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
            continue;
        };
        if frame.event == "auth" {
            if let Ok(payload) = serde_json::from_value::<AuthPayload>(frame.data) {
                return Some(payload.token);
            }
            return None;
        }
    }
    None
}

// ── Media namespace (anonymous) ────────────────────────

pub async fn media_gateway_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let user_id = params
        .get("userId")
        .cloned()
        .unwrap_or_else(|| format!("user-{}", Uuid::new_v4()));
    let display_name = params
        .get("displayName")
        .cloned()
        .unwrap_or_else(|| "Anonymous".to_string());
    ws.on_upgrade(move |socket| handle_media_connection(state, socket, user_id, display_name))
}

pub async fn handle_media_connection(
    state: AppState,
    socket: WebSocket,
    user_id: String,
    display_name: String,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let socket_id: SocketId = Uuid::new_v4().to_string();

    let sender_task = spawn_sender(ws_sender, rx);
    state.gateway.register(&socket_id, tx);
    state
        .gateway
        .set_identity(&socket_id, &user_id, Some(&display_name));
    tracing::info!(user_id = %user_id, socket_id = %socket_id, "Media client connected");

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let frame: Frame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        let ack_id = frame.ack;
        let ack = media::handle_event(&state, &socket_id, &user_id, &display_name, frame).await;
        if let (Some(ack_id), Some(payload)) = (ack_id, ack) {
            state.gateway.send_to_socket(&socket_id, Frame::ack(ack_id, payload));
        }
    }

    media::handle_disconnect(&state, &socket_id).await;
    state.gateway.unregister(&socket_id);
    sender_task.abort();
    tracing::info!(user_id = %user_id, socket_id = %socket_id, "Media client disconnected");
}

// ── Shared sender task ─────────────────────────────────

fn spawn_sender(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    fn test_config(secret: &str) -> AppConfig {
        serde_json::from_value(json!({
            "auth": {"jwt_secret": secret},
            "jobs": {"base_url": "http://localhost:9"},
        }))
        .unwrap()
    }

    fn sign(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_subject() {
        let config = test_config("top-secret");
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = sign("top-secret", json!({"sub": "u1", "walletType": "evm", "exp": exp}));
        let claims = validate_token(&config, &token).unwrap();
        assert_eq!(claims.sub, "u1");
    }

    #[test]
    fn wrong_secret_fails_auth() {
        let config = test_config("right");
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = sign("wrong", json!({"sub": "u1", "exp": exp}));
        assert!(matches!(
            validate_token(&config, &token),
            Err(GatewayError::AuthFailed)
        ));
    }

    #[test]
    fn expired_token_fails_auth() {
        let config = test_config("s");
        let exp = chrono::Utc::now().timestamp() - 600;
        let token = sign("s", json!({"sub": "u1", "exp": exp}));
        assert!(validate_token(&config, &token).is_err());
    }

}
