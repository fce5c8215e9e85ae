use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::auth::middleware::AuthToken;
use crate::error::ApiError;
use crate::store::releases::{self, Release};
use crate::store::{AppState, StoreError, outbox, services};
use crate::validation;

use super::helpers::{PageParams, PageResponse, record_audit};

#[derive(Debug, Deserialize)]
pub struct TriggerBuildRequest {
    pub git_sha: String,
    pub branch: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/v1/services/{id}/releases",
        get(list_releases).post(trigger_build),
    )
}

async fn list_releases(
    State(state): State<AppState>,
    _auth: AuthToken,
    Path(id): Path<Uuid>,
    Query(params): Query<PageParams>,
) -> Result<Json<PageResponse<Release>>, ApiError> {
    services::get(&state.pool, id).await?;
    let (cursor, limit) = params.decode()?;
    let page = releases::list_for_service(&state.pool, id, cursor, limit).await?;
    Ok(Json(PageResponse::from_page(page)))
}

/// Explicit build trigger: same release + outbox transaction the webhook
/// ingestor uses, minus the delivery row.
#[tracing::instrument(skip(state, body), fields(%id), err)]
async fn trigger_build(
    State(state): State<AppState>,
    auth: AuthToken,
    Path(id): Path<Uuid>,
    Json(body): Json<TriggerBuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validation::check_git_sha(&body.git_sha)?;
    if let Some(branch) = &body.branch {
        validation::check_branch_name(branch)?;
    }

    let service = services::get(&state.pool, id).await?;
    let branch = body.branch.as_deref().unwrap_or("main");

    let mut tx = state.pool.begin().await.map_err(StoreError::from)?;
    let release = releases::create_next(&mut tx, service.id, &body.git_sha, branch)
        .await
        .map_err(|e| match e {
            StoreError::Conflict(msg) => ApiError::ServiceUnavailable(msg),
            other => other.into(),
        })?;
    outbox::push(
        &mut tx,
        outbox::KIND_ENQUEUE_BUILD,
        &serde_json::json!({
            "release_id": release.id,
            "service_id": service.id,
        }),
    )
    .await?;
    tx.commit().await.map_err(StoreError::from)?;

    state.outbox_notify.notify_one();

    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "release.trigger".into(),
            resource: "release".into(),
            resource_id: Some(release.id),
            outcome: "ok".into(),
            metadata: Some(serde_json::json!({
                "git_sha": body.git_sha,
                "version": release.version,
            })),
        },
    )?;

    Ok((StatusCode::CREATED, Json(release)))
}
