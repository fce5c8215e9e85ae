use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::auth::middleware::AuthToken;
use crate::error::ApiError;
use crate::store::addons::{self, Addon};
use crate::store::{AppState, projects};
use crate::validation;

use super::helpers::record_audit;

#[derive(Debug, Deserialize)]
pub struct CreateAddonRequest {
    pub addon_type: String,
    pub name: String,
    pub config: Option<serde_json::Value>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/projects/{slug}/addons",
            get(list_addons).post(create_addon),
        )
        .route("/v1/addons/{id}", get(get_addon).delete(delete_addon))
}

#[tracing::instrument(skip(state, body), fields(%slug), err)]
async fn create_addon(
    State(state): State<AppState>,
    auth: AuthToken,
    Path(slug): Path<String>,
    Json(body): Json<CreateAddonRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validation::check_slug("name", &body.name)?;

    let project = projects::get_by_slug(&state.pool, &slug).await?;
    let addon = addons::create(
        &state.pool,
        project.id,
        &body.addon_type,
        &body.name,
        body.config.unwrap_or_else(|| serde_json::json!({})),
    )
    .await?;

    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "addon.create".into(),
            resource: "addon".into(),
            resource_id: Some(addon.id),
            outcome: "ok".into(),
            metadata: Some(serde_json::json!({
                "type": addon.addon_type,
                "project": slug,
            })),
        },
    )?;

    Ok((StatusCode::CREATED, Json(addon)))
}

async fn list_addons(
    State(state): State<AppState>,
    _auth: AuthToken,
    Path(slug): Path<String>,
) -> Result<Json<Vec<Addon>>, ApiError> {
    let project = projects::get_by_slug(&state.pool, &slug).await?;
    Ok(Json(addons::list_for_project(&state.pool, project.id).await?))
}

async fn get_addon(
    State(state): State<AppState>,
    _auth: AuthToken,
    Path(id): Path<Uuid>,
) -> Result<Json<Addon>, ApiError> {
    Ok(Json(addons::get(&state.pool, id).await?))
}

/// Start the deletion lifecycle (`deleting → deleted`); refused while
/// bindings exist. The addon reconciler removes the backing resources.
#[tracing::instrument(skip(state), fields(%id), err)]
async fn delete_addon(
    State(state): State<AppState>,
    auth: AuthToken,
    Path(id): Path<Uuid>,
) -> Result<Json<Addon>, ApiError> {
    // Compliance-tagged: the record must be durable before the mutation.
    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "addon.delete".into(),
            resource: "addon".into(),
            resource_id: Some(id),
            outcome: "ok".into(),
            metadata: None,
        },
    )?;

    let addon = addons::start_deleting(&state.pool, id).await?;
    Ok(Json(addon))
}
