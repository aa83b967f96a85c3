//! WebSocket transport: one task pair per connected user.
//!
//! The token is checked before the upgrade, so an unauthenticated client never
//! gets a session. Outbound events go through the session's bounded queue;
//! a dedicated writer task drains it into the socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use courier_shared::protocol::{ClientEvent, ServerEvent};
use courier_shared::types::{ForwardTargetKind, GroupId, UserId};

use crate::api::AppState;
use crate::auth::bearer_token;
use crate::calls::InviteRequest;
use crate::chat::SendDirect;
use crate::error::ServerError;
use crate::extract::Query;
use crate::forward::{ForwardRequest, ForwardSource, ForwardTarget};
use crate::groups::SendGroup;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let token = params
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| ServerError::Unauthorized("missing token".to_string()))?;
    let user = state.auth.verify(token)?;

    Ok(ws.on_upgrade(move |socket| run_session(state, user, socket)))
}

async fn run_session(state: AppState, user: UserId, socket: WebSocket) {
    let (handle, mut outbound) = state.sessions.open_session(user.clone());
    let session_id = handle.session_id;
    let opened_at = handle.created_at;
    state.sessions.register(handle).await;

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode {} event: {e}", event.name());
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_state = state.clone();
    let reader_user = user.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => handle_frame(&reader_state, &reader_user, &text).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(user = %reader_user, "Socket read failed: {e}");
                    break;
                }
            }
        }
    });

    // Whichever half finishes first takes the other down. The writer ends on
    // its own when a newer session replaces this one.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.sessions.unregister_session(&user, session_id).await;
    info!(
        user = %user,
        session = %session_id,
        connected_secs = (Utc::now() - opened_at).num_seconds(),
        "Session closed"
    );
}

/// Rate-limit, parse and dispatch one inbound frame. Failures are reported to
/// the sender as an `error` event.
pub(crate) async fn handle_frame(state: &AppState, user: &UserId, text: &str) {
    if !state.event_limiter.check(user).await {
        warn!(user = %user, "Transport rate limit exceeded");
        state
            .dispatcher
            .push(
                user,
                ServerEvent::Error {
                    kind: "rate_limited".to_string(),
                    message: "Too many events, slow down".to_string(),
                    temp_id: None,
                },
            )
            .await;
        return;
    }

    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(user = %user, "Malformed client event: {e}");
            report(state, user, &ServerError::invalid(e.to_string()), None).await;
            return;
        }
    };

    let temp_id = event.temp_id().map(str::to_string);
    if let Err(e) = dispatch_event(state, user, event).await {
        debug!(user = %user, kind = e.kind(), "Client event failed: {e}");
        report(state, user, &e, temp_id).await;
    }
}

async fn report(state: &AppState, user: &UserId, err: &ServerError, temp_id: Option<String>) {
    state
        .dispatcher
        .push(
            user,
            ServerEvent::Error {
                kind: err.kind().to_string(),
                message: err.public_message(),
                temp_id,
            },
        )
        .await;
}

pub(crate) async fn dispatch_event(
    state: &AppState,
    user: &UserId,
    event: ClientEvent,
) -> Result<(), ServerError> {
    match event {
        ClientEvent::JoinGroup { group_id } => {
            state.groups.join_group(&group_id, user).await?;
        }
        ClientEvent::LeaveGroup { group_id } => {
            state.groups.leave_group(&group_id, user).await?;
        }
        ClientEvent::SendMessage {
            receiver_id,
            content,
            file_url,
            file_type,
            temp_id,
        } => {
            state
                .chat
                .send(
                    user,
                    SendDirect {
                        receiver_id,
                        content,
                        file_url,
                        file_type,
                        temp_id,
                    },
                )
                .await?;
        }
        ClientEvent::RecallMessage {
            message_id,
            receiver_id,
        } => {
            state.chat.recall(user, message_id, &receiver_id).await?;
        }
        ClientEvent::DeleteMessage { message_id } => {
            state.chat.delete(user, message_id).await?;
        }
        ClientEvent::ForwardMessage {
            message_id,
            source_peer_id,
            target_id,
            target_type,
        } => {
            let req = ForwardRequest {
                message_id,
                source: ForwardSource::Conversation {
                    peer: source_peer_id,
                },
                target: forward_target(target_type, target_id),
            };
            state.forwarder.forward(user, req).await?;
        }
        ClientEvent::SendGroupMessage {
            group_id,
            content,
            file_url,
            file_type,
            temp_id,
        } => {
            state
                .groups
                .send_message(
                    &group_id,
                    user,
                    SendGroup {
                        content,
                        file_url,
                        file_type,
                        temp_id,
                    },
                )
                .await?;
        }
        ClientEvent::RecallGroupMessage {
            group_id,
            message_id,
        } => {
            state
                .groups
                .recall_message(&group_id, message_id, user)
                .await?;
        }
        ClientEvent::DeleteGroupMessage {
            group_id,
            message_id,
        } => {
            state.groups.delete_message(&group_id, message_id, user)?;
        }
        ClientEvent::ForwardGroupMessage {
            source_group_id,
            source_message_id,
            target_id,
            target_type,
        } => {
            let req = ForwardRequest {
                message_id: source_message_id,
                source: ForwardSource::Group(source_group_id),
                target: forward_target(target_type, target_id),
            };
            state.forwarder.forward(user, req).await?;
        }
        ClientEvent::Typing { receiver_id } => {
            state
                .dispatcher
                .push(
                    &receiver_id,
                    ServerEvent::Typing {
                        sender_id: user.clone(),
                    },
                )
                .await;
        }
        ClientEvent::StopTyping { receiver_id } => {
            state
                .dispatcher
                .push(
                    &receiver_id,
                    ServerEvent::StopTyping {
                        sender_id: user.clone(),
                    },
                )
                .await;
        }
        ClientEvent::CallInvite {
            receiver_id,
            room_name,
            call_type,
        } => {
            state
                .calls
                .invite(
                    user,
                    InviteRequest {
                        receiver_id,
                        room_name,
                        call_type,
                    },
                )
                .await?;
        }
        ClientEvent::CallAccept { call_id } => {
            state.calls.accept(user, &call_id).await?;
        }
        ClientEvent::CallDecline { call_id } => {
            state.calls.decline(user, &call_id).await?;
        }
        ClientEvent::CallEnd { call_id } => {
            state.calls.end(user, &call_id).await?;
        }
    }
    Ok(())
}

pub(crate) fn forward_target(kind: ForwardTargetKind, target_id: String) -> ForwardTarget {
    match kind {
        ForwardTargetKind::Group => ForwardTarget::Group(GroupId::new(target_id)),
        ForwardTargetKind::Conversation => ForwardTarget::Direct(UserId::new(target_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::store::Store;
    use tokio::sync::mpsc;

    fn state() -> AppState {
        AppState::new(ServerConfig::default(), Store::in_memory().unwrap())
    }

    async fn connect(state: &AppState, user: &str) -> mpsc::Receiver<ServerEvent> {
        let (handle, rx) = state.sessions.open_session(UserId::from(user));
        state.sessions.register(handle).await;
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn send_frame_reaches_the_receiver() {
        let state = state();
        let mut alice = connect(&state, "alice").await;
        let mut bob = connect(&state, "bob").await;
        drain(&mut alice);

        let frame = r#"{"event":"send-message","data":{"receiverId":"bob","content":"hi","tempId":"t-9"}}"#;
        handle_frame(&state, &UserId::from("alice"), frame).await;

        assert!(drain(&mut bob)
            .iter()
            .any(|e| matches!(e, ServerEvent::NewMessage(p) if p.content == "hi")));
        assert!(drain(&mut alice)
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageSent { temp_id: Some(t), .. } if t == "t-9")));
    }

    #[tokio::test]
    async fn failures_come_back_as_error_events() {
        let state = state();
        let mut alice = connect(&state, "alice").await;
        drain(&mut alice);

        let frame = r#"{"event":"send-message","data":{"receiverId":"bob","content":"","tempId":"t-1"}}"#;
        handle_frame(&state, &UserId::from("alice"), frame).await;
        handle_frame(&state, &UserId::from("alice"), "not json").await;

        let errors: Vec<_> = drain(&mut alice)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Error { kind, temp_id, .. } => Some((kind, temp_id)),
                _ => None,
            })
            .collect();
        assert_eq!(
            errors,
            vec![
                ("invalid".to_string(), Some("t-1".to_string())),
                ("invalid".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn typing_is_relayed() {
        let state = state();
        let mut bob = connect(&state, "bob").await;
        let frame = r#"{"event":"typing","data":{"receiverId":"bob"}}"#;
        handle_frame(&state, &UserId::from("alice"), frame).await;

        assert!(drain(&mut bob).contains(&ServerEvent::Typing {
            sender_id: UserId::from("alice")
        }));
    }

    #[test]
    fn forward_targets_follow_the_kind() {
        assert_eq!(
            forward_target(ForwardTargetKind::Group, "g1".into()),
            ForwardTarget::Group(GroupId::from("g1"))
        );
        assert_eq!(
            forward_target(ForwardTargetKind::Conversation, "bob".into()),
            ForwardTarget::Direct(UserId::from("bob"))
        );
    }
}
