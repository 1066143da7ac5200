use crate::Lookout;
use crate::error::AppError;
use crate::events::Join;
use crate::helpers::now;
use crate::json_cache::DataTag;
use crate::session::SessionAttributes;
use crate::tps::PerformanceSample;
use crate::validation;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use axum_macros::debug_handler;
use lookout_db::DbError;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
pub(crate) struct RegisterServerRequest {
    uuid: Uuid,
    name: String,
}

#[derive(Deserialize)]
pub(crate) struct JoinRequest {
    player: Uuid,
    server: Uuid,
    name: String,
    address: Option<String>,
    world: Option<String>,
    game_mode: Option<String>,
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct PlayerEvent {
    player: Uuid,
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct SwitchRequest {
    player: Uuid,
    server: Uuid,
    world: Option<String>,
    game_mode: Option<String>,
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct DeathRequest {
    victim: Uuid,
    killer: Option<Uuid>,
    weapon: Option<String>,
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct WorldRequest {
    player: Uuid,
    world: String,
    game_mode: String,
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct PlayerPing {
    player: Uuid,
    ping: i32,
}

#[derive(Deserialize)]
pub(crate) struct PingReport {
    pings: Vec<PlayerPing>,
}

#[derive(Deserialize)]
pub(crate) struct PerformanceReport {
    server: Uuid,
    #[serde(flatten)]
    sample: PerformanceSample,
}

#[derive(Deserialize)]
pub(crate) struct ViewQuery {
    scope: Option<Uuid>,
}

fn validate_optional_label(field: &'static str, value: &Option<String>) -> Result<(), AppError> {
    if let Some(value) = value {
        validation::validate_label(field, value)?;
    }
    Ok(())
}

#[debug_handler]
pub(crate) async fn register_server(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<RegisterServerRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_server_name(&payload.name)?;

    let server = lookout.register_server(payload.uuid, payload.name).await?;

    Ok((StatusCode::CREATED, Json(server)))
}

#[debug_handler]
pub(crate) async fn join(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<JoinRequest>,
) -> Result<impl IntoResponse, AppError> {
    let name = validation::validate_player_name(&payload.name)?;
    validate_optional_label("world", &payload.world)?;
    validate_optional_label("game_mode", &payload.game_mode)?;

    lookout
        .events
        .on_join(Join {
            player: payload.player,
            server: payload.server,
            timestamp: payload.timestamp.unwrap_or_else(now),
            name,
            address: payload.address,
            attributes: SessionAttributes {
                world: payload.world,
                game_mode: payload.game_mode,
            },
        })
        .await?;

    Ok(StatusCode::OK)
}

#[debug_handler]
pub(crate) async fn quit(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<PlayerEvent>,
) -> Result<impl IntoResponse, AppError> {
    lookout
        .events
        .on_quit(payload.player, payload.timestamp.unwrap_or_else(now))
        .await?;

    Ok(StatusCode::OK)
}

#[debug_handler]
pub(crate) async fn switch(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<SwitchRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate_optional_label("world", &payload.world)?;
    validate_optional_label("game_mode", &payload.game_mode)?;
    if !lookout.db.server_exists(payload.server).await? {
        return Err(DbError::ServerNotFound.into());
    }

    lookout
        .events
        .on_switch(
            payload.player,
            payload.server,
            payload.timestamp.unwrap_or_else(now),
            SessionAttributes {
                world: payload.world,
                game_mode: payload.game_mode,
            },
        )
        .await?;

    Ok(StatusCode::OK)
}

#[debug_handler]
pub(crate) async fn death(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<DeathRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate_optional_label("weapon", &payload.weapon)?;

    lookout
        .events
        .on_death(
            payload.victim,
            payload.timestamp.unwrap_or_else(now),
            payload.killer,
            payload.weapon,
        )
        .await?;

    Ok(StatusCode::OK)
}

#[debug_handler]
pub(crate) async fn world_change(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<WorldRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_label("world", &payload.world)?;
    validation::validate_label("game_mode", &payload.game_mode)?;

    lookout
        .events
        .on_world_change(
            payload.player,
            payload.world,
            payload.game_mode,
            payload.timestamp.unwrap_or_else(now),
        )
        .await?;

    Ok(StatusCode::OK)
}

pub(crate) async fn activity(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<PlayerEvent>,
) -> Result<impl IntoResponse, AppError> {
    lookout
        .events
        .on_activity(payload.player, payload.timestamp.unwrap_or_else(now))
        .await?;

    Ok(StatusCode::OK)
}

pub(crate) async fn mob_kill(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<PlayerEvent>,
) -> Result<impl IntoResponse, AppError> {
    lookout
        .events
        .on_mob_kill(payload.player, payload.timestamp.unwrap_or_else(now))
        .await?;

    Ok(StatusCode::OK)
}

/// Latest ping for a batch of players. Sampled on the next collector tick;
/// players the collector is not tracking are skipped.
#[debug_handler]
pub(crate) async fn report_ping(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<PingReport>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_batch(&payload.pings)?;

    let reported_at = now();
    for entry in payload.pings {
        if lookout.ping.state(entry.player).await.is_some() {
            lookout.pings.report(entry.player, entry.ping, reported_at).await;
        }
    }

    Ok(StatusCode::ACCEPTED)
}

#[debug_handler]
pub(crate) async fn report_performance(
    State(lookout): State<Arc<Lookout>>,
    Json(payload): Json<PerformanceReport>,
) -> Result<impl IntoResponse, AppError> {
    if !lookout.db.server_exists(payload.server).await? {
        return Err(DbError::ServerNotFound.into());
    }

    lookout
        .performance
        .report(payload.server, payload.sample, now())
        .await;

    Ok(StatusCode::ACCEPTED)
}

#[debug_handler]
pub(crate) async fn view(
    State(lookout): State<Arc<Lookout>>,
    Path(tag): Path<DataTag>,
    Query(query): Query<ViewQuery>,
) -> Result<impl IntoResponse, AppError> {
    let payload = lookout.views.request(tag, query.scope).await?;

    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        payload.to_string(),
    ))
}
