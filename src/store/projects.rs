use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{Cursor, Page, StoreError};

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Project {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub team_id: Option<Uuid>,
    pub git_repo: String,
    pub default_branch: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct NewProject<'a> {
    pub slug: &'a str,
    pub name: &'a str,
    pub team_id: Option<Uuid>,
    pub git_repo: &'a str,
    pub default_branch: &'a str,
}

/// Idempotent on `slug`: re-creating an existing slug returns `Conflict`.
/// Runs in the caller's transaction so default environments seed atomically.
pub async fn create(conn: &mut PgConnection, new: &NewProject<'_>) -> Result<Project, StoreError> {
    let project = sqlx::query_as::<_, Project>(
        r#"
        INSERT INTO projects (slug, name, team_id, git_repo, default_branch)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(new.slug)
    .bind(new.name)
    .bind(new.team_id)
    .bind(new.git_repo)
    .bind(new.default_branch)
    .fetch_one(conn)
    .await?;

    Ok(project)
}

pub async fn get_by_slug(pool: &PgPool, slug: &str) -> Result<Project, StoreError> {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE slug = $1 AND is_active = true")
        .bind(slug)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("project".into()))
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Project, StoreError> {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1 AND is_active = true")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("project".into()))
}

pub async fn list(
    pool: &PgPool,
    cursor: Option<Cursor>,
    limit: i64,
) -> Result<Page<Project>, StoreError> {
    let rows = match cursor {
        Some(c) => {
            sqlx::query_as::<_, Project>(
                r#"
                SELECT * FROM projects
                WHERE is_active = true AND (created_at, id) < ($1, $2)
                ORDER BY created_at DESC, id DESC
                LIMIT $3
                "#,
            )
            .bind(c.created_at)
            .bind(c.id)
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Project>(
                r#"
                SELECT * FROM projects WHERE is_active = true
                ORDER BY created_at DESC, id DESC
                LIMIT $1
                "#,
            )
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(Page::from_rows(rows, limit, |p| Cursor {
        created_at: p.created_at,
        id: p.id,
    }))
}

pub async fn update(
    pool: &PgPool,
    slug: &str,
    name: Option<&str>,
    git_repo: Option<&str>,
    default_branch: Option<&str>,
) -> Result<Project, StoreError> {
    sqlx::query_as::<_, Project>(
        r#"
        UPDATE projects SET
            name = COALESCE($2, name),
            git_repo = COALESCE($3, git_repo),
            default_branch = COALESCE($4, default_branch),
            updated_at = now()
        WHERE slug = $1 AND is_active = true
        RETURNING *
        "#,
    )
    .bind(slug)
    .bind(name)
    .bind(git_repo)
    .bind(default_branch)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound("project".into()))
}

/// Soft delete. Refused while active services exist.
pub async fn soft_delete(pool: &PgPool, slug: &str) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    let project_id: Uuid =
        sqlx::query_scalar("SELECT id FROM projects WHERE slug = $1 AND is_active = true")
            .bind(slug)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound("project".into()))?;

    let service_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM services WHERE project_id = $1 AND is_active = true",
    )
    .bind(project_id)
    .fetch_one(&mut *tx)
    .await?;

    if service_count > 0 {
        return Err(StoreError::Conflict(
            "project still has active services".into(),
        ));
    }

    sqlx::query("UPDATE projects SET is_active = false, updated_at = now() WHERE id = $1")
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Active services whose `git_repo` matches the incoming push, with the
/// project's default branch for branch-policy fallback.
#[derive(Debug, sqlx::FromRow)]
pub struct RepoMatch {
    pub service_id: Uuid,
    pub project_id: Uuid,
    pub build_branch: Option<String>,
    pub default_branch: String,
    pub auto_deploy_env: Option<String>,
}

pub async fn services_for_repo(pool: &PgPool, repo_url: &str) -> Result<Vec<RepoMatch>, StoreError> {
    let rows = sqlx::query_as::<_, RepoMatch>(
        r#"
        SELECT s.id AS service_id, p.id AS project_id,
               s.build_branch, p.default_branch, s.auto_deploy_env
        FROM services s
        JOIN projects p ON p.id = s.project_id AND p.is_active = true
        WHERE s.is_active = true AND p.git_repo = $1
        "#,
    )
    .bind(repo_url)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
