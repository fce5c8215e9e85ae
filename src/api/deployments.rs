use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::auth::middleware::AuthToken;
use crate::error::ApiError;
use crate::store::deployments::{self, Deployment};
use crate::store::{AppState, environments, releases, services};

use super::helpers::{PageParams, PageResponse, record_audit};

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    /// A `ready` release of this service. Pointing at an older release is a
    /// rollback; the reconciler treats both identically.
    pub release_id: Uuid,
    pub environment: String,
    pub replicas: Option<i32>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/services/{id}/deployments",
            get(list_deployments).post(promote),
        )
        .route("/v1/deployments/{id}/ack", post(acknowledge))
}

async fn list_deployments(
    State(state): State<AppState>,
    _auth: AuthToken,
    Path(id): Path<Uuid>,
    Query(params): Query<PageParams>,
) -> Result<Json<PageResponse<Deployment>>, ApiError> {
    services::get(&state.pool, id).await?;
    let (cursor, limit) = params.decode()?;
    let page = deployments::list_for_service(&state.pool, id, cursor, limit).await?;
    Ok(Json(PageResponse::from_page(page)))
}

/// Promote a ready release into an environment, or roll back by promoting an
/// older one. Creates a new Deployment row either way; the previous running
/// deployment is superseded once this one reaches `running`.
#[tracing::instrument(skip(state, body), fields(%id), err)]
async fn promote(
    State(state): State<AppState>,
    auth: AuthToken,
    Path(id): Path<Uuid>,
    Json(body): Json<PromoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = services::get(&state.pool, id).await?;
    let release = releases::get_ready(&state.pool, body.release_id).await?;
    if release.service_id != service.id {
        return Err(ApiError::BadRequest(
            "release belongs to a different service".into(),
        ));
    }

    let environment =
        environments::get_by_name(&state.pool, service.project_id, &body.environment).await?;

    let replicas = match body.replicas {
        Some(n) => {
            crate::validation::check_replicas(n)?;
            n
        }
        None => service.replicas_for(&environment.name),
    };

    // Rollback when a newer ready release than the target exists.
    let latest_ready: Option<i64> = releases::list_for_service(&state.pool, service.id, None, 50)
        .await?
        .items
        .iter()
        .filter(|r| r.status == releases::status::READY)
        .map(|r| r.version)
        .max();
    let is_rollback = latest_ready.is_some_and(|latest| release.version < latest);
    let action = if is_rollback {
        "deployment.rollback"
    } else {
        "deployment.promote"
    };

    // Compliance-tagged when rolling back: the record must land before the
    // mutation.
    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: action.into(),
            resource: "deployment".into(),
            resource_id: None,
            outcome: "ok".into(),
            metadata: Some(serde_json::json!({
                "release_id": release.id,
                "version": release.version,
                "environment": environment.name,
            })),
        },
    )?;

    let deployment = deployments::create_superseding(
        &state.pool,
        release.id,
        service.id,
        environment.id,
        replicas,
    )
    .await?;

    tracing::info!(
        deployment_id = %deployment.id,
        release_id = %release.id,
        env = %environment.name,
        rollback = is_rollback,
        "deployment requested"
    );

    Ok((StatusCode::CREATED, Json(deployment)))
}

/// Human acknowledgment of a quota-rejected deployment; reconciling resumes.
#[tracing::instrument(skip(state), fields(%id), err)]
async fn acknowledge(
    State(state): State<AppState>,
    auth: AuthToken,
    Path(id): Path<Uuid>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment = deployments::acknowledge_failure(&state.pool, id).await?;

    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "deployment.ack_failure".into(),
            resource: "deployment".into(),
            resource_id: Some(deployment.id),
            outcome: "ok".into(),
            metadata: None,
        },
    )?;

    Ok(Json(deployment))
}
