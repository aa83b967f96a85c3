use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    http::{Method, StatusCode},
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_shared::protocol::{ForwardedMessage, GroupMessagePayload, MessagePayload};
use courier_shared::types::{CallId, CallStatus, ForwardTargetKind, GroupId, MessageId, UserId};

use crate::auth::{AuthUser, JwtVerifier};
use crate::calls::{CallEngine, CallStats, CallSummary, InviteRequest};
use crate::chat::{ChatService, HistoryQuery, HistoryView, SendDirect};
use crate::config::ServerConfig;
use crate::conversations::{ConversationList, ConversationService};
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::extract::{Json, Path, Query};
use crate::forward::{ForwardRequest, ForwardService, ForwardSource};
use crate::groups::{GroupEngine, GroupListQuery, GroupMessagesView, SendGroup};
use crate::membership::StoreMembership;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::sessions::SessionRegistry;
use crate::store::Store;
use crate::ws::{forward_target, ws_handler};

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub dispatcher: Dispatcher,
    pub conversations: ConversationService,
    pub chat: ChatService,
    pub groups: GroupEngine,
    pub forwarder: ForwardService,
    pub calls: CallEngine,
    pub auth: JwtVerifier,
    pub rate_limiter: RateLimiter<IpAddr>,
    pub event_limiter: RateLimiter<UserId>,
}

impl AppState {
    pub fn new(config: ServerConfig, store: Store) -> Self {
        let sessions = SessionRegistry::new(config.session_queue_size);
        let dispatcher = Dispatcher::new(sessions.clone());
        let conversations = ConversationService::new(store.clone());
        let chat = ChatService::new(
            store.clone(),
            conversations.clone(),
            dispatcher.clone(),
            config.recall_window,
        );
        let groups = GroupEngine::new(
            store.clone(),
            Arc::new(StoreMembership::new(store.clone())),
            dispatcher.clone(),
            config.recall_window,
        );
        let forwarder = ForwardService::new(
            store.clone(),
            chat.clone(),
            groups.clone(),
            dispatcher.clone(),
        );
        let calls = CallEngine::new(
            store.clone(),
            conversations.clone(),
            dispatcher.clone(),
            config.call_ring_timeout,
        );

        Self {
            auth: JwtVerifier::new(&config.jwt_secret),
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            event_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            sessions,
            dispatcher,
            conversations,
            chat,
            groups,
            forwarder,
            calls,
        }
    }
}

impl FromRef<AppState> for JwtVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        // Direct messages
        .route("/api/chat/conversations", get(list_conversations))
        .route("/api/chat/history/:peer", get(direct_history))
        .route("/api/chat/messages", post(send_direct))
        .route("/api/chat/messages/recall", put(recall_direct))
        .route("/api/chat/messages/delete", delete(delete_direct))
        .route("/api/chat/messages/forward", post(forward_direct))
        .route("/api/chat/read/:peer", post(mark_conversation_read))
        .route("/api/chat/online", get(online_users))
        // Groups
        .route(
            "/api/chat-group/:group/messages",
            get(list_group_messages).post(send_group_message),
        )
        .route(
            "/api/chat-group/:group/messages/forward",
            post(forward_group_message),
        )
        .route(
            "/api/chat-group/:group/messages/:id/recall",
            put(recall_group_message),
        )
        .route(
            "/api/chat-group/:group/messages/:id",
            delete(delete_group_message),
        )
        .route("/api/chat-group/:group/read", post(mark_group_read))
        .route("/api/chat-group/:group/unread", get(group_unread))
        // Calls
        .route("/api/video-call/invite", post(call_invite))
        .route("/api/video-call/accept", post(call_accept))
        .route("/api/video-call/decline", post(call_decline))
        .route("/api/video-call/end", post(call_end))
        .route("/api/video-call/status", post(call_status))
        .route("/api/video-call/history", get(call_history))
        .route("/api/video-call/stats/:call", get(call_stats))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online_sessions: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online_sessions: state.sessions.session_count().await,
    })
}

// ---------------------------------------------------------------------------
// Direct messages
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ConversationsQuery {
    limit: Option<u32>,
    cursor: Option<String>,
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(q): Query<ConversationsQuery>,
) -> Result<Json<ConversationList>, ServerError> {
    let list = state
        .conversations
        .list_for_user(&user, q.limit, q.cursor.as_deref())?;
    Ok(Json(list))
}

async fn online_users(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
) -> Json<Vec<UserId>> {
    Json(state.sessions.online_users().await)
}

async fn direct_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(peer): Path<UserId>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<HistoryView>, ServerError> {
    Ok(Json(state.chat.history(&user, &peer, &q)?))
}

async fn send_direct(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<SendDirect>,
) -> Result<(StatusCode, Json<MessagePayload>), ServerError> {
    let message = state.chat.send(&user, req).await?;
    Ok((StatusCode::CREATED, Json(MessagePayload::from(&message))))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecallDirectRequest {
    message_id: MessageId,
    receiver_id: UserId,
}

async fn recall_direct(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<RecallDirectRequest>,
) -> Result<Json<MessagePayload>, ServerError> {
    let message = state
        .chat
        .recall(&user, req.message_id, &req.receiver_id)
        .await?;
    Ok(Json(MessagePayload::from(&message)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteDirectRequest {
    message_id: MessageId,
}

async fn delete_direct(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<DeleteDirectRequest>,
) -> Result<Json<MessagePayload>, ServerError> {
    let message = state.chat.delete(&user, req.message_id).await?;
    Ok(Json(MessagePayload::from(&message)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardDirectRequest {
    message_id: MessageId,
    source_peer_id: UserId,
    target_id: String,
    #[serde(default = "direct_target")]
    target_type: ForwardTargetKind,
}

fn direct_target() -> ForwardTargetKind {
    ForwardTargetKind::Conversation
}

async fn forward_direct(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<ForwardDirectRequest>,
) -> Result<(StatusCode, Json<ForwardedMessage>), ServerError> {
    let forwarded = state
        .forwarder
        .forward(
            &user,
            ForwardRequest {
                message_id: req.message_id,
                source: ForwardSource::Conversation {
                    peer: req.source_peer_id,
                },
                target: forward_target(req.target_type, req.target_id),
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(forwarded)))
}

#[derive(Serialize)]
struct ReadResponse {
    updated: bool,
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(peer): Path<UserId>,
) -> Result<Json<ReadResponse>, ServerError> {
    let updated = state.conversations.mark_read(&user, &peer)?;
    Ok(Json(ReadResponse { updated }))
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

async fn list_group_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(group): Path<GroupId>,
    Query(q): Query<GroupListQuery>,
) -> Result<Json<GroupMessagesView>, ServerError> {
    Ok(Json(state.groups.list_messages(&group, &user, &q)?))
}

async fn send_group_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(group): Path<GroupId>,
    Json(req): Json<SendGroup>,
) -> Result<(StatusCode, Json<GroupMessagePayload>), ServerError> {
    let payload = state.groups.send_message(&group, &user, req).await?;
    Ok((StatusCode::CREATED, Json(payload)))
}

async fn recall_group_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((group, id)): Path<(GroupId, MessageId)>,
) -> Result<Json<GroupMessagePayload>, ServerError> {
    Ok(Json(state.groups.recall_message(&group, id, &user).await?))
}

async fn delete_group_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((group, id)): Path<(GroupId, MessageId)>,
) -> Result<StatusCode, ServerError> {
    state.groups.delete_message(&group, id, &user)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardGroupRequest {
    message_id: MessageId,
    target_id: String,
    target_type: ForwardTargetKind,
}

async fn forward_group_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(group): Path<GroupId>,
    Json(req): Json<ForwardGroupRequest>,
) -> Result<(StatusCode, Json<ForwardedMessage>), ServerError> {
    let forwarded = state
        .forwarder
        .forward(
            &user,
            ForwardRequest {
                message_id: req.message_id,
                source: ForwardSource::Group(group),
                target: forward_target(req.target_type, req.target_id),
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(forwarded)))
}

async fn mark_group_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(group): Path<GroupId>,
) -> Result<StatusCode, ServerError> {
    state.groups.mark_read(&group, &user)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadResponse {
    group_id: GroupId,
    unread_count: u64,
}

async fn group_unread(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(group): Path<GroupId>,
) -> Result<Json<UnreadResponse>, ServerError> {
    let unread_count = state.groups.unread_count(&group, &user)?;
    Ok(Json(UnreadResponse {
        group_id: group,
        unread_count,
    }))
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallRef {
    call_id: CallId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    call_id: CallId,
    status: CallStatus,
    duration: Option<i64>,
}

#[derive(Deserialize)]
struct CallHistoryQuery {
    before: Option<DateTime<Utc>>,
    limit: Option<u32>,
}

async fn call_invite(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<InviteRequest>,
) -> Result<(StatusCode, Json<CallSummary>), ServerError> {
    let call = state.calls.invite(&user, req).await?;
    Ok((StatusCode::CREATED, Json(CallSummary::from(&call))))
}

async fn call_accept(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CallRef>,
) -> Result<Json<CallSummary>, ServerError> {
    let call = state.calls.accept(&user, &req.call_id).await?;
    Ok(Json(CallSummary::from(&call)))
}

async fn call_decline(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CallRef>,
) -> Result<Json<CallSummary>, ServerError> {
    let call = state.calls.decline(&user, &req.call_id).await?;
    Ok(Json(CallSummary::from(&call)))
}

async fn call_end(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CallRef>,
) -> Result<Json<CallSummary>, ServerError> {
    let call = state.calls.end(&user, &req.call_id).await?;
    Ok(Json(CallSummary::from(&call)))
}

async fn call_status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<StatusReport>,
) -> Result<Json<CallSummary>, ServerError> {
    let call = state
        .calls
        .report_status(&user, &req.call_id, req.status, req.duration)
        .await?;
    Ok(Json(CallSummary::from(&call)))
}

async fn call_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(q): Query<CallHistoryQuery>,
) -> Result<Json<Vec<CallSummary>>, ServerError> {
    Ok(Json(state.calls.history(&user, q.before, q.limit)?))
}

async fn call_stats(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(call): Path<CallId>,
) -> Result<Json<CallStats>, ServerError> {
    Ok(Json(state.calls.stats(&user, &call)?))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::testing::add_member;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState::new(ServerConfig::default(), Store::in_memory().unwrap())
    }

    fn token(state: &AppState, user: &str) -> String {
        state
            .auth
            .issue(&UserId::from(user), chrono::Duration::minutes(10))
            .unwrap()
    }

    fn request(method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(t) = bearer {
            builder = builder.header("authorization", format!("Bearer {t}"));
        }
        match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn health_is_public() {
        let state = state();
        let (status, body) = call(&state, request(Method::GET, "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["onlineSessions"], 0);
    }

    #[tokio::test]
    async fn online_list_reflects_sessions() {
        let state = state();
        let (handle, _rx) = state.sessions.open_session(UserId::from("bob"));
        state.sessions.register(handle).await;

        let alice = token(&state, "alice");
        let (status, body) = call(
            &state,
            request(Method::GET, "/api/chat/online", Some(&alice), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(["bob"]));
    }

    #[tokio::test]
    async fn malformed_requests_get_invalid_bodies() {
        let state = state();
        let alice = token(&state, "alice");

        let (status, body) = call(
            &state,
            request(
                Method::POST,
                "/api/chat/messages",
                Some(&alice),
                Some(json!({ "content": "hi" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid");
        assert!(body["message"].as_str().unwrap().contains("receiverId"));

        let (status, body) = call(
            &state,
            request(
                Method::POST,
                "/api/video-call/accept",
                Some(&alice),
                Some(json!({ "callId": "nope" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid");

        let (status, body) = call(
            &state,
            request(
                Method::PUT,
                "/api/chat-group/g1/messages/not-a-uuid/recall",
                Some(&alice),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid");

        let (status, body) = call(
            &state,
            request(Method::GET, "/api/video-call/stats/nope", Some(&alice), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid");
    }

    #[tokio::test]
    async fn api_requires_a_valid_token() {
        let state = state();
        let (status, body) = call(
            &state,
            request(Method::GET, "/api/chat/conversations", None, None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = call(
            &state,
            request(Method::GET, "/api/chat/conversations", Some("garbage"), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn send_then_list_and_read() {
        let state = state();
        let alice = token(&state, "alice");
        let bob = token(&state, "bob");

        let (status, sent) = call(
            &state,
            request(
                Method::POST,
                "/api/chat/messages",
                Some(&alice),
                Some(json!({ "receiverId": "bob", "content": "hello" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent["content"], "hello");

        let (_, list) = call(
            &state,
            request(Method::GET, "/api/chat/conversations", Some(&bob), None),
        )
        .await;
        let first = &list["conversations"][0];
        assert_eq!(first["peerId"], "alice");
        assert_eq!(first["unreadCount"], 1);

        let (status, read) = call(
            &state,
            request(Method::POST, "/api/chat/read/alice", Some(&bob), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["updated"], true);

        let (_, history) = call(
            &state,
            request(Method::GET, "/api/chat/history/alice?order=asc", Some(&bob), None),
        )
        .await;
        assert_eq!(history["days"][0]["messages"][0]["content"], "hello");
    }

    #[tokio::test]
    async fn recall_by_someone_else_is_forbidden() {
        let state = state();
        let alice = token(&state, "alice");
        let bob = token(&state, "bob");

        let (_, sent) = call(
            &state,
            request(
                Method::POST,
                "/api/chat/messages",
                Some(&alice),
                Some(json!({ "receiverId": "bob", "content": "mine" })),
            ),
        )
        .await;

        let (status, body) = call(
            &state,
            request(
                Method::PUT,
                "/api/chat/messages/recall",
                Some(&bob),
                Some(json!({ "messageId": sent["messageId"], "receiverId": "alice" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
    }

    #[tokio::test]
    async fn group_routes_check_membership() {
        let store = Store::in_memory().unwrap();
        let state = AppState::new(ServerConfig::default(), store.clone());
        add_member(&store, "g1", "alice", true);
        let alice = token(&state, "alice");
        let mallory = token(&state, "mallory");

        let (status, _) = call(
            &state,
            request(
                Method::POST,
                "/api/chat-group/g1/messages",
                Some(&mallory),
                Some(json!({ "content": "let me in" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, sent) = call(
            &state,
            request(
                Method::POST,
                "/api/chat-group/g1/messages",
                Some(&alice),
                Some(json!({ "content": "hi all" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let uri = format!("/api/chat-group/g1/messages/{}", sent["messageId"].as_str().unwrap());
        let (status, _) = call(&state, request(Method::DELETE, &uri, Some(&alice), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, view) = call(
            &state,
            request(Method::GET, "/api/chat-group/g1/messages", Some(&alice), None),
        )
        .await;
        assert_eq!(view["days"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn call_lifecycle_over_http() {
        let state = state();
        let alice = token(&state, "alice");
        let bob = token(&state, "bob");

        let (status, invited) = call(
            &state,
            request(
                Method::POST,
                "/api/video-call/invite",
                Some(&alice),
                Some(json!({ "receiverId": "bob", "callType": "audio" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(invited["status"], "ringing");
        let call_id = invited["callId"].clone();

        let (_, accepted) = call(
            &state,
            request(
                Method::POST,
                "/api/video-call/accept",
                Some(&bob),
                Some(json!({ "callId": call_id })),
            ),
        )
        .await;
        assert_eq!(accepted["status"], "accepted");

        let (status, body) = call(
            &state,
            request(
                Method::POST,
                "/api/video-call/status",
                Some(&bob),
                Some(json!({ "callId": call_id, "status": "missed" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid");

        let (_, ended) = call(
            &state,
            request(
                Method::POST,
                "/api/video-call/end",
                Some(&bob),
                Some(json!({ "callId": call_id })),
            ),
        )
        .await;
        assert_eq!(ended["status"], "ended");
        assert_eq!(ended["endedBy"], "bob");

        let (_, history) = call(
            &state,
            request(Method::GET, "/api/video-call/history", Some(&alice), None),
        )
        .await;
        assert_eq!(history.as_array().unwrap().len(), 1);

        let uri = format!("/api/video-call/stats/{}", call_id.as_str().unwrap());
        let (status, _) = call(&state, request(Method::GET, &uri, Some(&token(&state, "carol")), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
