use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use application::{
    BanRequest, ModerationHistoryFilter, MuteRequest, PhantomReport, ReactionOutcome, RoomStats, SendEvoucherRequest,
    SendMentionRequest, SendMessageRequest, WorkerPoolStatus,
};
use domain::{
    ChatMessage, EnrichedMessage, EvoucherInfo, MessageId, ModerationRecord, ModerationStatus, ModerationTerm,
    MuteRestriction, Reaction, RoomId, StickerInfo, UserId,
};

use crate::{error::ApiError, state::AppState, websocket::websocket_upgrade};

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    user_id: Uuid,
    #[serde(default)]
    message: String,
    sticker: Option<StickerInfo>,
    reply_to: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct SendMentionPayload {
    user_id: Uuid,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SendEvoucherPayload {
    user_id: Uuid,
    #[serde(default)]
    message: String,
    evoucher: EvoucherInfo,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct ReactionPayload {
    user_id: Uuid,
    reaction: String,
}

#[derive(Debug, Deserialize)]
struct BanPayload {
    user_id: Uuid,
    moderator_id: Uuid,
    /// 例如 `30m`、`2h`、`permanent`
    duration: Option<String>,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct MutePayload {
    user_id: Uuid,
    moderator_id: Uuid,
    duration: Option<String>,
    restriction: Option<MuteRestriction>,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct KickPayload {
    user_id: Uuid,
    moderator_id: Uuid,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct RevokePayload {
    user_id: Uuid,
    moderator_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct HistoryFilterQuery {
    room_id: Option<Uuid>,
    user_id: Option<Uuid>,
    limit: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/rooms/{room_id}", get(websocket_upgrade))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/rooms/{room_id}/messages",
            post(send_message).get(get_history).delete(clear_room_cache),
        )
        .route("/rooms/{room_id}/mentions", post(send_mention))
        .route("/rooms/{room_id}/evouchers", post(send_evoucher))
        .route("/rooms/{room_id}/stats", get(room_stats))
        .route(
            "/messages/{message_id}/reactions",
            post(toggle_reaction).get(list_reactions),
        )
        .route(
            "/messages/{message_id}/reactions/{user_id}",
            delete(remove_reaction),
        )
        .route("/rooms/{room_id}/moderation/ban", post(ban_user))
        .route("/rooms/{room_id}/moderation/mute", post(mute_user))
        .route("/rooms/{room_id}/moderation/kick", post(kick_user))
        .route("/rooms/{room_id}/moderation/unban", post(unban_user))
        .route("/rooms/{room_id}/moderation/unmute", post(unmute_user))
        .route(
            "/rooms/{room_id}/moderation/status/{user_id}",
            get(moderation_status),
        )
        .route("/moderation/history", get(moderation_history))
        .route("/pipeline/status", get(pipeline_status))
        .route("/pipeline/phantom-detection", post(trigger_phantom_detection))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn send_message(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    if payload.message.trim().is_empty() && payload.sticker.is_none() {
        return Err(ApiError::bad_request("message or sticker is required"));
    }
    let message = state
        .chat
        .send_message(SendMessageRequest {
            room_id: RoomId::from(room_id),
            user_id: UserId::from(payload.user_id),
            message: payload.message,
            sticker: payload.sticker,
            reply_to: payload.reply_to.map(MessageId::from),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

async fn send_mention(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<SendMentionPayload>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    if payload.message.trim().is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }
    let message = state
        .chat
        .send_mention_message(SendMentionRequest {
            room_id: RoomId::from(room_id),
            user_id: UserId::from(payload.user_id),
            message: payload.message,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

async fn send_evoucher(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<SendEvoucherPayload>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let message = state
        .chat
        .send_evoucher_message(SendEvoucherRequest {
            room_id: RoomId::from(room_id),
            user_id: UserId::from(payload.user_id),
            message: payload.message,
            evoucher: payload.evoucher,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

async fn get_history(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<EnrichedMessage>>, ApiError> {
    let items = state
        .chat
        .get_chat_history(
            RoomId::from(room_id),
            query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
            query.user_id.map(UserId::from),
        )
        .await?;

    Ok(Json(items))
}

async fn clear_room_cache(State(state): State<AppState>, Path(room_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.chat.delete_room_messages(RoomId::from(room_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn room_stats(State(state): State<AppState>, Path(room_id): Path<Uuid>) -> Json<RoomStats> {
    Json(state.chat.room_stats(RoomId::from(room_id)))
}

async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Json(payload): Json<ReactionPayload>,
) -> Result<Json<ReactionOutcome>, ApiError> {
    let outcome = state
        .reactions
        .toggle_reaction(
            MessageId::from(message_id),
            UserId::from(payload.user_id),
            &payload.reaction,
        )
        .await?;

    Ok(Json(outcome))
}

async fn list_reactions(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Vec<Reaction>>, ApiError> {
    Ok(Json(state.reactions.reactions(MessageId::from(message_id)).await?))
}

async fn remove_reaction(
    State(state): State<AppState>,
    Path((message_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ReactionOutcome>, ApiError> {
    let outcome = state
        .reactions
        .remove_reaction(MessageId::from(message_id), UserId::from(user_id))
        .await?;

    Ok(Json(outcome))
}

fn parse_term(state: &AppState, duration: Option<&str>) -> Result<ModerationTerm, ApiError> {
    Ok(ModerationTerm::parse(duration.unwrap_or("permanent"), state.clock.now())?)
}

async fn ban_user(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<BanPayload>,
) -> Result<(StatusCode, Json<ModerationRecord>), ApiError> {
    let term = parse_term(&state, payload.duration.as_deref())?;
    let record = state
        .moderation
        .ban_user(BanRequest {
            user_id: UserId::from(payload.user_id),
            room_id: RoomId::from(room_id),
            moderator_id: UserId::from(payload.moderator_id),
            term,
            reason: payload.reason,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn mute_user(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<MutePayload>,
) -> Result<(StatusCode, Json<ModerationRecord>), ApiError> {
    let term = parse_term(&state, payload.duration.as_deref())?;
    let record = state
        .moderation
        .mute_user(MuteRequest {
            user_id: UserId::from(payload.user_id),
            room_id: RoomId::from(room_id),
            moderator_id: UserId::from(payload.moderator_id),
            term,
            restriction: payload.restriction.unwrap_or(MuteRestriction::CanView),
            reason: payload.reason,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn kick_user(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<KickPayload>,
) -> Result<(StatusCode, Json<ModerationRecord>), ApiError> {
    let record = state
        .moderation
        .kick_user(
            UserId::from(payload.user_id),
            RoomId::from(room_id),
            UserId::from(payload.moderator_id),
            payload.reason,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn unban_user(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<RevokePayload>,
) -> Result<Json<ModerationRecord>, ApiError> {
    let record = state
        .moderation
        .unban_user(
            UserId::from(payload.user_id),
            RoomId::from(room_id),
            UserId::from(payload.moderator_id),
        )
        .await?;

    Ok(Json(record))
}

async fn unmute_user(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<RevokePayload>,
) -> Result<Json<ModerationRecord>, ApiError> {
    let record = state
        .moderation
        .unmute_user(
            UserId::from(payload.user_id),
            RoomId::from(room_id),
            UserId::from(payload.moderator_id),
        )
        .await?;

    Ok(Json(record))
}

async fn moderation_status(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ModerationStatus>, ApiError> {
    let status = state
        .moderation
        .user_moderation_status(UserId::from(user_id), RoomId::from(room_id))
        .await?;

    Ok(Json(status))
}

async fn moderation_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryFilterQuery>,
) -> Result<Json<Vec<ModerationRecord>>, ApiError> {
    let filter = ModerationHistoryFilter {
        room_id: query.room_id.map(RoomId::from),
        user_id: query.user_id.map(UserId::from),
        limit: query.limit,
    };
    Ok(Json(state.moderation.moderation_history(&filter).await?))
}

async fn pipeline_status(State(state): State<AppState>) -> Json<WorkerPoolStatus> {
    Json(state.chat.pipeline_status())
}

async fn trigger_phantom_detection(State(state): State<AppState>) -> Result<Json<PhantomReport>, ApiError> {
    Ok(Json(state.chat.trigger_phantom_detection().await?))
}
