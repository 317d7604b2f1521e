use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use server_api::{
    channels, messages, reactions, users, ApiContext, InMemoryCounterStore, Limits, RateLimiter,
};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::{
        ChannelSummary, CreateChannelRequest, ListMessagesQuery, MemberSummary,
        MembershipPayload, MessagePayload, PostMessageRequest, ReactionPayload, ReactionsByEmoji,
        SessionRequest, SessionResponse, ToggleReactionRequest, UpdateChannelRequest,
        UpdateMemberRequest, UpdateMessageRequest, UpdateProfileRequest, UserProfile,
    },
};
use storage::Storage;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod error;
mod realtime;

use auth::{CurrentUser, SessionKeys};
use config::{load_settings, prepare_database_url};
use error::HttpResult;

const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) sessions: SessionKeys,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let rate_limiter = RateLimiter::new(
        Arc::new(InMemoryCounterStore::default()),
        settings.rate_limit_max_actions,
        Duration::from_secs(settings.rate_limit_window_secs),
    );
    let api = ApiContext::new(storage)
        .with_limits(Limits {
            reaction_cap: settings.reaction_cap,
            channel_cap: settings.channel_cap,
        })
        .with_rate_limiter(Arc::new(rate_limiter));
    let state = AppState {
        api,
        sessions: SessionKeys::new(&settings.session_secret, settings.session_ttl_hours),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/session", post(create_session))
        .route("/me", get(get_me).patch(update_me))
        .route("/channels", get(list_channels).post(create_channel))
        .route(
            "/channels/:channel_id",
            patch(update_channel).delete(delete_channel),
        )
        .route("/channels/:channel_id/join", post(join_channel))
        .route("/channels/:channel_id/members", get(list_members))
        .route(
            "/channels/:channel_id/members/:user_id",
            patch(update_member).delete(remove_member),
        )
        .route(
            "/channels/:channel_id/messages",
            get(list_messages).post(post_message),
        )
        .route(
            "/channels/:channel_id/messages/:message_id",
            patch(update_message).delete(delete_message),
        )
        .route(
            "/channels/:channel_id/messages/:message_id/replies",
            get(list_replies),
        )
        .route(
            "/channels/:channel_id/messages/:message_id/reactions",
            get(list_reactions).post(toggle_reaction),
        )
        .route("/realtime", get(realtime::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.api.storage.health_check().await.map_err(|err| {
        error!(error = %format!("{err:#}"), "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> HttpResult<Json<SessionResponse>> {
    let user = users::sync_user(&state.api, &req.email, &req.name).await?;
    let token = state.sessions.issue(user.id, &user.email)?;
    info!(user_id = user.id.0, "session issued");
    Ok(Json(SessionResponse { token, user }))
}

async fn get_me(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> HttpResult<Json<UserProfile>> {
    Ok(Json(users::get_profile(&state.api, user_id).await?))
}

async fn update_me(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<UpdateProfileRequest>,
) -> HttpResult<Json<UserProfile>> {
    Ok(Json(users::update_profile(&state.api, user_id, req).await?))
}

async fn list_channels(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> HttpResult<Json<Vec<ChannelSummary>>> {
    Ok(Json(channels::list_channels(&state.api, user_id).await?))
}

async fn create_channel(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<CreateChannelRequest>,
) -> HttpResult<Json<ChannelSummary>> {
    Ok(Json(channels::create_channel(&state.api, user_id, req).await?))
}

async fn update_channel(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(channel_id): Path<i64>,
    Json(req): Json<UpdateChannelRequest>,
) -> HttpResult<Json<ChannelSummary>> {
    let channel = channels::update_channel(&state.api, user_id, ChannelId(channel_id), req).await?;
    Ok(Json(channel))
}

async fn delete_channel(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(channel_id): Path<i64>,
) -> HttpResult<StatusCode> {
    channels::delete_channel(&state.api, user_id, ChannelId(channel_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn join_channel(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(channel_id): Path<i64>,
) -> HttpResult<Json<MembershipPayload>> {
    Ok(Json(
        channels::join_channel(&state.api, user_id, ChannelId(channel_id)).await?,
    ))
}

async fn list_members(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(channel_id): Path<i64>,
) -> HttpResult<Json<Vec<MemberSummary>>> {
    Ok(Json(
        channels::list_members(&state.api, user_id, ChannelId(channel_id)).await?,
    ))
}

async fn update_member(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path((channel_id, target)): Path<(i64, i64)>,
    Json(req): Json<UpdateMemberRequest>,
) -> HttpResult<Json<MembershipPayload>> {
    let membership = channels::update_member_role(
        &state.api,
        user_id,
        ChannelId(channel_id),
        UserId(target),
        req.role,
    )
    .await?;
    Ok(Json(membership))
}

async fn remove_member(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path((channel_id, target)): Path<(i64, i64)>,
) -> HttpResult<StatusCode> {
    channels::remove_member(&state.api, user_id, ChannelId(channel_id), UserId(target)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(channel_id): Path<i64>,
    Query(query): Query<ListMessagesQuery>,
) -> HttpResult<Json<Vec<MessagePayload>>> {
    let page = messages::list_messages(&state.api, user_id, ChannelId(channel_id), &query).await?;
    Ok(Json(page))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(channel_id): Path<i64>,
    Json(req): Json<PostMessageRequest>,
) -> HttpResult<Json<MessagePayload>> {
    let message = messages::post_message(&state.api, user_id, ChannelId(channel_id), req).await?;
    Ok(Json(message))
}

async fn update_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path((channel_id, message_id)): Path<(i64, i64)>,
    Json(req): Json<UpdateMessageRequest>,
) -> HttpResult<Json<MessagePayload>> {
    let message = messages::update_message(
        &state.api,
        user_id,
        ChannelId(channel_id),
        MessageId(message_id),
        &req.content,
    )
    .await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path((channel_id, message_id)): Path<(i64, i64)>,
) -> HttpResult<StatusCode> {
    messages::delete_message(
        &state.api,
        user_id,
        ChannelId(channel_id),
        MessageId(message_id),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_replies(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path((channel_id, message_id)): Path<(i64, i64)>,
) -> HttpResult<Json<Vec<MessagePayload>>> {
    let replies = messages::list_replies(
        &state.api,
        user_id,
        ChannelId(channel_id),
        MessageId(message_id),
    )
    .await?;
    Ok(Json(replies))
}

async fn toggle_reaction(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path((channel_id, message_id)): Path<(i64, i64)>,
    Json(req): Json<ToggleReactionRequest>,
) -> HttpResult<Json<ReactionsByEmoji>> {
    let grouped = reactions::toggle_reaction(
        &state.api,
        user_id,
        ChannelId(channel_id),
        MessageId(message_id),
        &req.emoji,
    )
    .await?;
    Ok(Json(grouped))
}

async fn list_reactions(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path((channel_id, message_id)): Path<(i64, i64)>,
) -> HttpResult<Json<Vec<ReactionPayload>>> {
    let rows = reactions::list_reactions(
        &state.api,
        user_id,
        ChannelId(channel_id),
        MessageId(message_id),
    )
    .await?;
    Ok(Json(rows))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
