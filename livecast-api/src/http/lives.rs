//! Live metadata endpoints

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use livecast_core::credentials::strip_bearer;
use livecast_core::models::{CreateLive, Live, RoomId};
use livecast_core::Identity;
use tracing::info;

use super::{AppError, AppResult, AppState};

/// Credential from `Authorization`, with or without the `Bearer` scheme
fn authenticate(state: &AppState, headers: &HeaderMap) -> AppResult<Identity> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(strip_bearer)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::unauthorized("Missing authorization token"))?;
    Ok(state.verifier.verify(token)?)
}

pub async fn create_live(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateLive>,
) -> AppResult<(StatusCode, Json<Live>)> {
    let identity = authenticate(&state, &headers)?;
    let live = state.store.create(Some(&identity.subject), request).await?;
    info!(live_id = %live.id, slug = %live.slug, owner = %identity.subject, "Live created");
    Ok((StatusCode::CREATED, Json(live)))
}

pub async fn list_lives(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<Live>>> {
    authenticate(&state, &headers)?;
    Ok(Json(state.store.list_active().await?))
}

/// Look a live up by id, then by slug
pub async fn get_live(
    State(state): State<AppState>,
    Path(id_or_slug): Path<String>,
) -> AppResult<Json<Live>> {
    let live = match state.store.get(&RoomId::from(id_or_slug.as_str())).await? {
        Some(live) => Some(live),
        None => state.store.find_by_slug(&id_or_slug).await?,
    };
    live.map(Json)
        .ok_or_else(|| AppError::not_found(format!("Live not found: {id_or_slug}")))
}

/// End a live and tear its media state down
pub async fn end_live(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<Live>> {
    let identity = authenticate(&state, &headers)?;
    let room_id = RoomId::from(id);
    let live = state
        .store
        .get(&room_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Live not found: {room_id}")))?;
    if !live.is_owned_by(&identity.subject) {
        return Err(AppError::forbidden("Only the owner can end this live"));
    }

    let ended = state.store.end(&room_id).await?;
    state.signaling.registry.close_room(&room_id);
    state.signaling.gate.seats().clear_room(&room_id);
    info!(live_id = %room_id, subject = %identity.subject, "Live ended");
    Ok(Json(ended))
}
