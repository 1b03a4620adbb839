//! SignalingHub connection handling — accept, authenticate, heartbeat, and
//! route signaling/chat/presence messages for one WebSocket socket.
//!
//! Generalizes the teacher's TLS-TCP connection task (`tcp.rs`, now
//! removed): one task per accepted socket, a writer task fed by an mpsc
//! channel, an auth phase gated by a timeout. What changed is the wire
//! format (postcard binary -> JSON text frames) and the message set
//! (voice-server control messages -> WebRTC-style signaling).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use voipc_protocol::messages::{close_codes, AuthUser, ClientMessage, ServerMessage};
use voipc_protocol::types::WsClientId;

use crate::floor::{FloorController, FloorDecision};
use crate::hub::{is_voice_room, SignalingHub, AUTH_TIMEOUT, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT};
use crate::token::TokenService;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_USERNAME_LEN: usize = 32;

/// Accept one TCP connection, upgrade it to a WebSocket (rejecting on a
/// configured-but-mismatched `Origin`), and drive its lifecycle.
pub async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<SignalingHub>,
    tokens: Arc<TokenService>,
    floor: Arc<FloorController>,
    allowed_origins: Arc<Vec<String>>,
) {
    let origin_check = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if allowed_origins.is_empty() {
            return Ok(resp);
        }
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if allowed_origins.iter().any(|o| o == origin) {
            Ok(resp)
        } else {
            let mut rejection = ErrorResponse::new(Some("origin not allowed".to_string()));
            *rejection.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
            Err(rejection)
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, origin_check).await {
        Ok(s) => s,
        Err(e) => {
            debug!(%addr, "WebSocket handshake failed: {e}");
            return;
        }
    };

    let client_id = generate_client_id();
    info!(%addr, client_id = %client_id, "accepted WebSocket connection");
    handle_connection(ws_stream, client_id, hub, tokens, floor).await;
}

fn generate_client_id() -> WsClientId {
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let rand_suffix: u32 = rand::thread_rng().gen();
    format!("user_{}_{}", to_base36(time as u64), to_base36(rand_suffix as u64))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

async fn handle_connection(
    ws_stream: WsStream,
    client_id: WsClientId,
    hub: Arc<SignalingHub>,
    tokens: Arc<TokenService>,
    floor: Arc<FloorController>,
) {
    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let send = |msg: &ServerMessage| {
        if let Ok(json) = serde_json::to_string(msg) {
            let _ = tx.send(Message::Text(json.into()));
        }
    };
    let close_with = |code: u16, reason: &str| {
        let _ = tx.send(Message::Close(Some(CloseFrame {
            code: code.into(),
            reason: reason.to_string().into(),
        })));
    };

    // --- Auth phase: only `auth` is accepted; everything else is rejected
    // without mutating any shared state. ---
    let user = tokio::select! {
        user = authenticate(&mut stream, &tokens, &send, &close_with) => user,
        _ = tokio::time::sleep(AUTH_TIMEOUT) => {
            send(&ServerMessage::AuthRequired);
            close_with(close_codes::AUTH_TIMEOUT, "authentication timed out");
            None
        }
    };

    let Some(user) = user else {
        writer.abort();
        return;
    };

    hub.register(client_id.clone(), user.id.clone(), user.username.clone(), tx.clone());
    send(&ServerMessage::AuthSuccess { user: user.clone() });
    info!(client_id = %client_id, user_id = %user.id, "signaling authenticated");

    run_message_loop(&mut stream, &tx, &client_id, &hub, &floor, &send, &close_with).await;

    let left_room = hub.disconnect(&client_id);
    writer.abort();

    if let Some(room) = &left_room {
        hub.broadcast_to_room(
            room,
            &ServerMessage::UserLeft {
                room_id: room.clone(),
                client_id: client_id.clone(),
            },
        );
        if is_voice_room(room) {
            hub.broadcast_to_all(&ServerMessage::VoiceChannelUpdate {
                channels: hub.voice_channel_snapshot(),
            });
        }
    }
    info!(client_id = %client_id, "signaling disconnected");
}

async fn authenticate(
    stream: &mut futures_util::stream::SplitStream<WsStream>,
    tokens: &TokenService,
    send: &impl Fn(&ServerMessage),
    close_with: &impl Fn(u16, &str),
) -> Option<AuthUser> {
    loop {
        let msg = stream.next().await?.ok()?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return None,
            _ => continue,
        };
        let parsed: ClientMessage = match serde_json::from_str(text.as_ref()) {
            Ok(m) => m,
            Err(_) => {
                send(&ServerMessage::AuthFailed {
                    error: "expected an auth message".into(),
                });
                close_with(close_codes::MISSING_TOKEN, "expected an auth message");
                return None;
            }
        };
        let ClientMessage::Auth { token } = parsed else {
            send(&ServerMessage::AuthFailed {
                error: "expected an auth message".into(),
            });
            close_with(close_codes::MISSING_TOKEN, "expected an auth message");
            return None;
        };
        return match tokens.verify(&token).await {
            Some(subject) => Some(AuthUser {
                id: subject.id,
                username: subject.username,
                display_name: subject.display_name,
            }),
            None => {
                send(&ServerMessage::AuthFailed {
                    error: "invalid or expired token".into(),
                });
                close_with(close_codes::BAD_TOKEN, "invalid or expired token");
                None
            }
        };
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_message_loop(
    stream: &mut futures_util::stream::SplitStream<WsStream>,
    tx: &mpsc::UnboundedSender<Message>,
    client_id: &WsClientId,
    hub: &Arc<SignalingHub>,
    floor: &Arc<FloorController>,
    send: &impl Fn(&ServerMessage),
    close_with: &impl Fn(u16, &str),
) {
    // Heartbeat is native WebSocket ping/pong, independent of the JSON
    // signaling envelope's own optional `ping`/`pong` message pair.
    let mut awaiting_pong = false;
    let mut last_pong = Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if awaiting_pong && last_pong.elapsed() > HEARTBEAT_INTERVAL + HEARTBEAT_TIMEOUT {
                    close_with(1000, "heartbeat timeout");
                    return;
                }
                let _ = tx.send(Message::Ping(Vec::new().into()));
                awaiting_pong = true;
            }
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { return; };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(text.as_ref()) {
                            Ok(parsed) => {
                                handle_message(parsed, client_id, hub, floor, send).await;
                            }
                            Err(e) => {
                                debug!(client_id = %client_id, "dropped malformed signaling message: {e}");
                            }
                        }
                    }
                    Message::Pong(_) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Message::Close(_) => return,
                    _ => {}
                }
            }
        }
    }
}

fn valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ')
}

fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

async fn handle_message(
    msg: ClientMessage,
    client_id: &WsClientId,
    hub: &Arc<SignalingHub>,
    floor: &Arc<FloorController>,
    send: &impl Fn(&ServerMessage),
) {
    match msg {
        ClientMessage::Auth { .. } => {
            debug!(client_id = %client_id, "ignoring post-auth auth message");
        }
        ClientMessage::Join { room_id, username } => {
            if !valid_room_id(&room_id) {
                debug!(client_id = %client_id, room_id = %room_id, "rejected invalid roomId");
                return;
            }
            if let Some(name) = &username {
                if !valid_username(name) {
                    debug!(client_id = %client_id, "rejected invalid username");
                    return;
                }
            }
            let outcome = hub.join_room(client_id, &room_id);
            let display_name = username
                .or_else(|| hub.username_of(client_id))
                .unwrap_or_default();

            if let Some(old) = &outcome.left {
                hub.broadcast_to_room(
                    old,
                    &ServerMessage::UserLeft {
                        room_id: old.clone(),
                        client_id: client_id.clone(),
                    },
                );
            }
            hub.broadcast_to_room(
                &room_id,
                &ServerMessage::UserJoined {
                    room_id: room_id.clone(),
                    client_id: client_id.clone(),
                    username: display_name,
                },
            );
            if outcome.entered_voice || outcome.left_was_voice {
                hub.broadcast_to_all(&ServerMessage::VoiceChannelUpdate {
                    channels: hub.voice_channel_snapshot(),
                });
            }
        }
        ClientMessage::Leave => {
            if let Some(room) = hub.leave_room(client_id) {
                hub.broadcast_to_room(
                    &room,
                    &ServerMessage::UserLeft {
                        room_id: room.clone(),
                        client_id: client_id.clone(),
                    },
                );
                if is_voice_room(&room) {
                    hub.broadcast_to_all(&ServerMessage::VoiceChannelUpdate {
                        channels: hub.voice_channel_snapshot(),
                    });
                }
            }
        }
        ClientMessage::Offer { to, data } => route_offer_answer(client_id, hub, to, data, true),
        ClientMessage::Answer { to, data } => route_offer_answer(client_id, hub, to, data, false),
        ClientMessage::IceCandidate { to, data } => {
            if !hub.is_connected(&to) {
                debug!(client_id = %client_id, to = %to, "ice-candidate target not connected");
                return;
            }
            hub.unicast(
                &to,
                &ServerMessage::IceCandidate {
                    from: client_id.clone(),
                    data,
                },
            );
        }
        ClientMessage::ScreenShareStart { quality } => {
            let Some(room) = hub.room_of(client_id) else {
                return;
            };
            let username = hub.username_of(client_id).unwrap_or_default();
            let desired = quality.unwrap_or_else(|| "720p30".to_string());
            match floor.request(&room, client_id, &username, &desired) {
                FloorDecision::Granted { quality, .. } => {
                    hub.broadcast_to_room(
                        &room,
                        &ServerMessage::ScreenShareStart {
                            client_id: client_id.clone(),
                            username,
                            quality,
                        },
                    );
                }
                FloorDecision::Denied { reason } => {
                    send(&ServerMessage::ScreenShareDenied {
                        reason: reason.to_string(),
                    });
                }
            }
        }
        ClientMessage::ScreenShareStop => {
            let Some(room) = hub.room_of(client_id) else {
                return;
            };
            floor.register_stop(&room, client_id);
            hub.broadcast_to_room(
                &room,
                &ServerMessage::ScreenShareStop {
                    client_id: client_id.clone(),
                },
            );
        }
        ClientMessage::TypingStart => {
            if let Some(room) = hub.room_of(client_id) {
                let username = hub.username_of(client_id).unwrap_or_default();
                hub.broadcast_to_room_except(
                    &room,
                    client_id,
                    &ServerMessage::TypingStart {
                        client_id: client_id.clone(),
                        username,
                    },
                );
            }
        }
        ClientMessage::TypingStop => {
            if let Some(room) = hub.room_of(client_id) {
                hub.broadcast_to_room_except(
                    &room,
                    client_id,
                    &ServerMessage::TypingStop {
                        client_id: client_id.clone(),
                    },
                );
            }
        }
        ClientMessage::Ping => send(&ServerMessage::Pong),
        ClientMessage::Pong => {}
    }
}

/// `offer`/`answer`: unicast to `to` if present and in the sender's room,
/// else broadcast to the rest of the room, tagged with the sender as `from`.
fn route_offer_answer(
    client_id: &WsClientId,
    hub: &Arc<SignalingHub>,
    to: Option<WsClientId>,
    data: serde_json::Value,
    is_offer: bool,
) {
    if data.is_null() {
        debug!(client_id = %client_id, "rejected offer/answer with null data");
        return;
    }
    let Some(room) = hub.room_of(client_id) else {
        return;
    };
    let wrap = |from: WsClientId, data: serde_json::Value| {
        if is_offer {
            ServerMessage::Offer { from, data }
        } else {
            ServerMessage::Answer { from, data }
        }
    };
    match to {
        Some(target) if hub.room_of(&target).as_deref() == Some(room.as_str()) => {
            hub.unicast(&target, &wrap(client_id.clone(), data));
        }
        _ => {
            hub.broadcast_to_room_except(&room, client_id, &wrap(client_id.clone(), data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_validation() {
        assert!(valid_room_id("general-chat_1"));
        assert!(!valid_room_id(""));
        assert!(!valid_room_id(&"a".repeat(129)));
        assert!(!valid_room_id("bad/room"));
    }

    #[test]
    fn username_validation() {
        assert!(valid_username("alice_99"));
        assert!(!valid_username(""));
        assert!(!valid_username("has space"));
        assert!(!valid_username(&"a".repeat(33)));
    }

    #[test]
    fn base36_roundtrip_is_nonempty_and_lowercase() {
        let s = to_base36(123456789);
        assert!(!s.is_empty());
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn generated_client_ids_have_expected_prefix() {
        let id = generate_client_id();
        assert!(id.starts_with("user_"));
    }
}
