pub mod admin;
pub mod auth;
pub mod conversation;
pub mod ws;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// `/health` and `/metrics` are public; the conversation surface sits behind
/// the `X-API-Key` middleware (which is a no-op in dev mode, i.e. when no
/// keys are configured).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/health", get(admin::health))
        .route("/metrics", get(admin::metrics));

    let protected = Router::new()
        .route("/conversation/message", post(conversation::message))
        .route(
            "/conversation/message-stream",
            post(conversation::message_stream),
        )
        .route(
            "/conversation/message-audio",
            post(conversation::message_audio),
        )
        .route(
            "/conversation/message-audio-stream",
            post(conversation::message_audio_stream),
        )
        .route(
            "/conversation/history/:session_id",
            get(conversation::history),
        )
        .route(
            "/conversation/clear/:session_id",
            delete(conversation::clear),
        )
        .route("/conversation/ws", get(ws::conversation_ws))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_key,
        ));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
