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
use crate::store::services::{self, NewService, Service, ServiceUpdate};
use crate::store::{AppState, addons, projects};
use crate::validation;

use super::helpers::{PageParams, PageResponse, record_audit};

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub dockerfile: Option<String>,
    pub buildpack: Option<String>,
    pub port: Option<i32>,
    pub env_vars: Option<serde_json::Value>,
    pub build_branch: Option<String>,
    pub auto_deploy_env: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub dockerfile: Option<String>,
    pub buildpack: Option<String>,
    pub port: Option<i32>,
    pub env_vars: Option<serde_json::Value>,
    pub replicas: Option<serde_json::Value>,
    pub build_branch: Option<String>,
    pub auto_deploy_env: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BindAddonRequest {
    pub env_prefix: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/projects/{slug}/services",
            get(list_services).post(create_service),
        )
        .route("/v1/services/{id}", get(get_service).patch(update_service))
        .route(
            "/v1/services/{id}/addons/{addon_id}",
            post(bind_addon).delete(unbind_addon),
        )
}

#[tracing::instrument(skip(state, body), fields(%slug), err)]
async fn create_service(
    State(state): State<AppState>,
    auth: AuthToken,
    Path(slug): Path<String>,
    Json(body): Json<CreateServiceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validation::check_slug("name", &body.name)?;
    if let Some(port) = body.port
        && !(1..=65535).contains(&port)
    {
        return Err(ApiError::BadRequest("port must be 1-65535".into()));
    }
    if let Some(branch) = &body.build_branch {
        validation::check_branch_name(branch)?;
    }
    if let Some(env_vars) = &body.env_vars
        && !env_vars.is_object()
    {
        return Err(ApiError::BadRequest("env_vars must be an object".into()));
    }

    let project = projects::get_by_slug(&state.pool, &slug).await?;

    let service = services::create(
        &state.pool,
        &NewService {
            project_id: project.id,
            name: &body.name,
            dockerfile: body.dockerfile.as_deref(),
            buildpack: body.buildpack.as_deref(),
            port: body.port.unwrap_or(8080),
            env_vars: body.env_vars.unwrap_or_else(|| serde_json::json!({})),
            build_branch: body.build_branch.as_deref(),
            auto_deploy_env: body.auto_deploy_env.as_deref(),
        },
    )
    .await?;

    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "service.create".into(),
            resource: "service".into(),
            resource_id: Some(service.id),
            outcome: "ok".into(),
            metadata: Some(serde_json::json!({"project": slug, "name": service.name})),
        },
    )?;

    Ok((StatusCode::CREATED, Json(service)))
}

async fn list_services(
    State(state): State<AppState>,
    _auth: AuthToken,
    Path(slug): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<PageResponse<Service>>, ApiError> {
    let project = projects::get_by_slug(&state.pool, &slug).await?;
    let (cursor, limit) = params.decode()?;
    let page = services::list_for_project(&state.pool, project.id, cursor, limit).await?;
    Ok(Json(PageResponse::from_page(page)))
}

async fn get_service(
    State(state): State<AppState>,
    _auth: AuthToken,
    Path(id): Path<Uuid>,
) -> Result<Json<Service>, ApiError> {
    Ok(Json(services::get(&state.pool, id).await?))
}

/// `build_config` mutations (dockerfile, buildpack) take effect on the next
/// release only; nothing here rebuilds existing releases.
#[tracing::instrument(skip(state, body), fields(%id), err)]
async fn update_service(
    State(state): State<AppState>,
    auth: AuthToken,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateServiceRequest>,
) -> Result<Json<Service>, ApiError> {
    if let Some(port) = body.port
        && !(1..=65535).contains(&port)
    {
        return Err(ApiError::BadRequest("port must be 1-65535".into()));
    }
    if let Some(branch) = &body.build_branch {
        validation::check_branch_name(branch)?;
    }
    if let Some(replicas) = &body.replicas {
        let Some(map) = replicas.as_object() else {
            return Err(ApiError::BadRequest("replicas must be an object".into()));
        };
        for (env, count) in map {
            let count = count
                .as_i64()
                .ok_or_else(|| ApiError::BadRequest(format!("replicas.{env} must be a number")))?;
            validation::check_replicas(i32::try_from(count).unwrap_or(-1))?;
        }
    }

    let service = services::update(
        &state.pool,
        id,
        &ServiceUpdate {
            dockerfile: body.dockerfile.as_deref(),
            buildpack: body.buildpack.as_deref(),
            port: body.port,
            env_vars: body.env_vars,
            replicas: body.replicas,
            build_branch: body.build_branch.as_deref(),
            auto_deploy_env: body.auto_deploy_env.as_deref(),
        },
    )
    .await?;

    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "service.update".into(),
            resource: "service".into(),
            resource_id: Some(service.id),
            outcome: "ok".into(),
            metadata: None,
        },
    )?;

    Ok(Json(service))
}

#[tracing::instrument(skip(state, body), fields(%id, %addon_id), err)]
async fn bind_addon(
    State(state): State<AppState>,
    auth: AuthToken,
    Path((id, addon_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<BindAddonRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let service = services::get(&state.pool, id).await?;
    let addon = addons::get(&state.pool, addon_id).await?;
    if addon.project_id != service.project_id {
        return Err(ApiError::BadRequest(
            "addon and service belong to different projects".into(),
        ));
    }

    let env_prefix = body.env_prefix.unwrap_or_default();
    if !env_prefix.is_empty()
        && !env_prefix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ApiError::BadRequest(
            "env_prefix must be uppercase alphanumeric or underscore".into(),
        ));
    }

    addons::bind(&state.pool, addon_id, id, &env_prefix).await?;

    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "addon.bind".into(),
            resource: "addon".into(),
            resource_id: Some(addon_id),
            outcome: "ok".into(),
            metadata: Some(serde_json::json!({"service_id": id})),
        },
    )?;

    Ok(Json(serde_json::json!({"ok": true})))
}

#[tracing::instrument(skip(state), fields(%id, %addon_id), err)]
async fn unbind_addon(
    State(state): State<AppState>,
    auth: AuthToken,
    Path((id, addon_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    addons::unbind(&state.pool, addon_id, id).await?;

    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "addon.unbind".into(),
            resource: "addon".into(),
            resource_id: Some(addon_id),
            outcome: "ok".into(),
            metadata: Some(serde_json::json!({"service_id": id})),
        },
    )?;

    Ok(Json(serde_json::json!({"ok": true})))
}
