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
use crate::ingest::event::normalize_repo_url;
use crate::store::projects::{self, NewProject, Project};
use crate::store::{AppState, StoreError, environments};
use crate::validation;

use super::helpers::{PageParams, PageResponse, record_audit};

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub slug: String,
    pub name: String,
    pub team_id: Option<Uuid>,
    pub git_repo: String,
    pub default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub git_repo: Option<String>,
    pub default_branch: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/projects", get(list_projects).post(create_project))
        .route(
            "/v1/projects/{slug}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/v1/projects/{slug}/environments", get(list_environments))
}

#[tracing::instrument(skip(state, body), err)]
async fn create_project(
    State(state): State<AppState>,
    auth: AuthToken,
    Json(body): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validation::check_slug("slug", &body.slug)?;
    validation::check_length("name", &body.name, 1, 255)?;
    validation::check_url("git_repo", &body.git_repo)?;
    if let Some(branch) = &body.default_branch {
        validation::check_branch_name(branch)?;
    }

    let git_repo = normalize_repo_url(&body.git_repo);

    let mut tx = state.pool.begin().await.map_err(StoreError::from)?;
    let project = projects::create(
        &mut tx,
        &NewProject {
            slug: &body.slug,
            name: &body.name,
            team_id: body.team_id,
            git_repo: &git_repo,
            default_branch: body.default_branch.as_deref().unwrap_or("main"),
        },
    )
    .await?;
    environments::seed_defaults(&mut tx, project.id, &project.slug).await?;
    tx.commit().await.map_err(StoreError::from)?;

    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "project.create".into(),
            resource: "project".into(),
            resource_id: Some(project.id),
            outcome: "ok".into(),
            metadata: Some(serde_json::json!({"slug": project.slug})),
        },
    )?;

    Ok((StatusCode::CREATED, Json(project)))
}

async fn list_projects(
    State(state): State<AppState>,
    _auth: AuthToken,
    Query(params): Query<PageParams>,
) -> Result<Json<PageResponse<Project>>, ApiError> {
    let (cursor, limit) = params.decode()?;
    let page = projects::list(&state.pool, cursor, limit).await?;
    Ok(Json(PageResponse::from_page(page)))
}

async fn get_project(
    State(state): State<AppState>,
    _auth: AuthToken,
    Path(slug): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(projects::get_by_slug(&state.pool, &slug).await?))
}

#[tracing::instrument(skip(state, body), fields(%slug), err)]
async fn update_project(
    State(state): State<AppState>,
    auth: AuthToken,
    Path(slug): Path<String>,
    Json(body): Json<UpdateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    if let Some(name) = &body.name {
        validation::check_length("name", name, 1, 255)?;
    }
    if let Some(git_repo) = &body.git_repo {
        validation::check_url("git_repo", git_repo)?;
    }
    if let Some(branch) = &body.default_branch {
        validation::check_branch_name(branch)?;
    }

    let git_repo = body.git_repo.as_deref().map(normalize_repo_url);
    let project = projects::update(
        &state.pool,
        &slug,
        body.name.as_deref(),
        git_repo.as_deref(),
        body.default_branch.as_deref(),
    )
    .await?;

    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "project.update".into(),
            resource: "project".into(),
            resource_id: Some(project.id),
            outcome: "ok".into(),
            metadata: None,
        },
    )?;

    Ok(Json(project))
}

#[tracing::instrument(skip(state), fields(%slug), err)]
async fn delete_project(
    State(state): State<AppState>,
    auth: AuthToken,
    Path(slug): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = projects::get_by_slug(&state.pool, &slug).await?;

    // Compliance-tagged action: audit must be durable before the mutation.
    record_audit(
        &state,
        AuditEvent {
            actor: auth.token_name.clone(),
            action: "project.delete".into(),
            resource: "project".into(),
            resource_id: Some(project.id),
            outcome: "ok".into(),
            metadata: Some(serde_json::json!({"slug": slug})),
        },
    )?;

    projects::soft_delete(&state.pool, &slug).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn list_environments(
    State(state): State<AppState>,
    _auth: AuthToken,
    Path(slug): Path<String>,
) -> Result<Json<Vec<environments::Environment>>, ApiError> {
    let project = projects::get_by_slug(&state.pool, &slug).await?;
    Ok(Json(
        environments::list_for_project(&state.pool, project.id).await?,
    ))
}
