//! WebSocket connection handling: authentication gate, pump loops, rate
//! limiting, and operation dispatch.
//!
//! The first message on a fresh socket must be `authenticate` and must
//! arrive within the auth timeout; everything after that flows through the
//! rate limiter and the closed operation table. Operations from a single
//! connection are processed in order (one at a time, here in the read
//! loop); operations from different connections interleave and serialize
//! per entity inside the use cases.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::domain::{RateLimitBucket, User};
use crate::infrastructure::dto::websocket::{ClientOp, envelope, envelope_null};
use crate::infrastructure::registry::SEND_BUFFER_SIZE;
use crate::ui::state::AppState;

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Authentication gate: nothing is registered until the token checks out
    let user = match authenticate_socket(&mut receiver, &state).await {
        Ok(user) => user,
        Err(reason) => {
            tracing::debug!("ws auth failed: {reason}");
            let _ = sender.close().await;
            return;
        }
    };

    // Full snapshot first, so the client renders without extra round trips
    let ready = match state.connect.build_ready(&user).await {
        Ok(ready) => ready,
        Err(err) => {
            tracing::error!(user_id = %user.id, "build ready: {err}");
            let _ = sender.close().await;
            return;
        }
    };
    if sender
        .send(Message::Text(envelope("ready", &ready).into()))
        .await
        .is_err()
    {
        return;
    }

    let conn_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
    let abort = Arc::new(Notify::new());
    state
        .connect
        .register(conn_id, &user, tx, Arc::clone(&abort))
        .await;
    tracing::info!(user_id = %user.id, username = %user.username, %conn_id, "client connected");

    let mut send_task = writer_loop(rx, sender, abort);

    let read_state = Arc::clone(&state);
    let read_user = user.clone();
    let mut recv_task = tokio::spawn(async move {
        read_loop(receiver, read_state, conn_id, read_user).await;
    });

    // Whichever pump stops first takes the other one down
    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    };

    state.connect.disconnect(conn_id, &user.id).await;
    tracing::info!(user_id = %user.id, %conn_id, "client disconnected");
}

/// First message must be a valid `authenticate` within the timeout.
async fn authenticate_socket(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<User, String> {
    let first = tokio::time::timeout(AUTH_TIMEOUT, receiver.next())
        .await
        .map_err(|_| "auth timeout".to_string())?;

    let text = match first {
        Some(Ok(Message::Text(text))) => text,
        _ => return Err("connection closed before auth".to_string()),
    };

    let Some(ClientOp::Authenticate(data)) = ClientOp::decode(text.as_str()) else {
        return Err("expected authenticate".to_string());
    };

    state
        .connect
        .authenticate(&data.token)
        .await
        .map_err(|err| err.to_string())
}

/// Outbound pump: registry events → socket, plus keepalive pings. Exits on
/// socket failure, a drained channel, or the registry firing the abort
/// (slow client / forced disconnect).
fn writer_loop(
    mut rx: mpsc::Receiver<String>,
    mut sender: SplitSink<WebSocket, Message>,
    abort: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    if sender.send(Message::Text(message.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                _ = abort.notified() => break,
            }
        }
        let _ = sender.close().await;
    })
}

/// Inbound pump: rate limit, decode, dispatch. Returning closes the
/// connection.
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    state: Arc<AppState>,
    conn_id: Uuid,
    user: User,
) {
    let mut bucket = RateLimitBucket::default();

    while let Some(message) = receiver.next().await {
        let Ok(message) = message else { break };
        match message {
            Message::Text(text) => {
                if !bucket.allow(state.clock.now_unix_secs()) {
                    // drop the connection rather than buffering an abuser
                    tracing::warn!(user_id = %user.id, "rate limit exceeded, closing connection");
                    break;
                }
                let Some(op) = ClientOp::decode(text.as_str()) else {
                    // malformed or unknown: drop the message, keep the socket
                    continue;
                };
                dispatch(&state, conn_id, &user, op).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// The routing table: one arm per operation of the protocol.
async fn dispatch(state: &AppState, conn_id: Uuid, user: &User, op: ClientOp) {
    match op {
        // a second authenticate on a live connection has nothing to do
        ClientOp::Authenticate(_) => {}
        ClientOp::Ping => {
            state
                .registry
                .send_to_connection(conn_id, &envelope_null("pong"))
                .await;
        }

        ClientOp::SendMessage(d) => state.chat.send_message(user, d).await,
        ClientOp::EditMessage(d) => state.chat.edit_message(user, d).await,
        ClientOp::DeleteMessage(d) => state.chat.delete_message(user, d).await,
        ClientOp::AddReaction(d) => state.chat.add_reaction(user, d).await,
        ClientOp::RemoveReaction(d) => state.chat.remove_reaction(user, d).await,
        ClientOp::TypingStart(d) => state.chat.typing_start(user, d).await,
        ClientOp::MarkNotificationRead(d) => state.chat.mark_notification_read(user, d).await,
        ClientOp::MarkAllNotificationsRead => state.chat.mark_all_notifications_read(user).await,

        ClientOp::CreateChannel(d) => state.channels.create_channel(user, d).await,
        ClientOp::DeleteChannel(d) => state.channels.delete_channel(user, d).await,

        ClientOp::JoinVoice(d) => state.voice.join(user, conn_id, d).await,
        ClientOp::LeaveVoice => state.voice.leave(user).await,
        ClientOp::VoiceSelfMute(d) => state.voice.set_self_mute(user, d.muted).await,
        ClientOp::VoiceSelfDeafen(d) => state.voice.set_self_deafen(user, d.deafened).await,
        ClientOp::VoiceSpeaking(d) => state.voice.set_speaking(user, d.speaking).await,
        ClientOp::VoiceServerMute(d) => state.voice.set_server_mute(user, d).await,
        ClientOp::WebrtcAnswer(d) => state.voice.handle_answer(user, &d.sdp).await,
        ClientOp::WebrtcIce(d) => state.voice.handle_ice(user, d.candidate).await,

        ClientOp::ScreenShareStart => state.screen.start(user, conn_id).await,
        ClientOp::ScreenShareStop => state.screen.stop(user).await,
        ClientOp::ScreenShareSubscribe(d) => state.screen.subscribe(user, conn_id, d).await,
        ClientOp::ScreenShareUnsubscribe(d) => state.screen.unsubscribe(user, d).await,
        ClientOp::WebrtcScreenAnswer(d) => {
            state.screen.handle_answer(user, &d.sdp, &d.role).await;
        }
        ClientOp::WebrtcScreenIce(d) => {
            state.screen.handle_ice(user, d.candidate, &d.role).await;
        }

        ClientOp::RadioTune(d) => state.radio.tune(&user.id, conn_id, d).await,
        ClientOp::RadioUntune => state.radio.untune(conn_id).await,
        ClientOp::RadioPlay(d) => state.radio.play(user, d).await,
        ClientOp::RadioPause(d) => state.radio.pause(user, d).await,
        ClientOp::RadioResume(d) => state.radio.resume(user, d).await,
        ClientOp::RadioSeek(d) => state.radio.seek(user, d).await,
        ClientOp::RadioSkip(d) => state.radio.skip(user, d).await,
        ClientOp::RadioStop(d) => state.radio.stop(user, d).await,
        ClientOp::RadioTrackEnded(d) => state.radio.track_ended(d).await,
        ClientOp::RadioStationCreate(d) => state.radio.station_create(user, d).await,
        ClientOp::RadioStationDelete(d) => state.radio.station_delete(user, d).await,
        ClientOp::RadioStationSetMode(d) => state.radio.station_set_mode(user, d).await,

        ClientOp::MediaPlay(d) => state.media.play(user, d).await,
        ClientOp::MediaPause(d) => state.media.pause(user, d).await,
        ClientOp::MediaSeek(d) => state.media.seek(user, d).await,
        ClientOp::MediaStop => state.media.stop(user).await,
    }
}
