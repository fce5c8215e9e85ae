use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreError;

/// Addon lifecycle: `pending → provisioning → ready | failed`, deletion via
/// `deleting → deleted`. A ready addon never regresses to provisioning.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const PROVISIONING: &str = "provisioning";
    pub const READY: &str = "ready";
    pub const FAILED: &str = "failed";
    pub const DELETING: &str = "deleting";
    pub const DELETED: &str = "deleted";
}

pub const ADDON_TYPES: &[&str] = &["postgres", "redis", "mysql"];

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Addon {
    pub id: Uuid,
    pub project_id: Uuid,
    pub addon_type: String,
    pub name: String,
    pub config: serde_json::Value,
    pub status: String,
    pub connection: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn create(
    pool: &PgPool,
    project_id: Uuid,
    addon_type: &str,
    name: &str,
    config: serde_json::Value,
) -> Result<Addon, StoreError> {
    if !ADDON_TYPES.contains(&addon_type) {
        return Err(StoreError::Validation(format!(
            "unknown addon type {addon_type}"
        )));
    }

    let addon = sqlx::query_as::<_, Addon>(
        r#"
        INSERT INTO addons (project_id, addon_type, name, config)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(project_id)
    .bind(addon_type)
    .bind(name)
    .bind(&config)
    .fetch_one(pool)
    .await?;

    Ok(addon)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Addon, StoreError> {
    sqlx::query_as::<_, Addon>("SELECT * FROM addons WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("addon".into()))
}

pub async fn list_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Addon>, StoreError> {
    let rows = sqlx::query_as::<_, Addon>(
        "SELECT * FROM addons WHERE project_id = $1 AND status != 'deleted' ORDER BY name",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Rows the addon reconciler acts on.
pub async fn list_reconcilable(pool: &PgPool) -> Result<Vec<Addon>, StoreError> {
    let rows = sqlx::query_as::<_, Addon>(
        r#"
        SELECT * FROM addons
        WHERE status IN ('pending', 'provisioning', 'deleting')
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Guarded transitions
// ---------------------------------------------------------------------------

pub async fn start_provisioning(pool: &PgPool, id: Uuid) -> Result<Addon, StoreError> {
    guarded(pool, id, status::PENDING, status::PROVISIONING).await
}

/// `provisioning → ready`, atomically writing connection fields so a ready
/// addon always carries them.
pub async fn mark_ready(
    pool: &PgPool,
    id: Uuid,
    connection: serde_json::Value,
) -> Result<Addon, StoreError> {
    let updated = sqlx::query_as::<_, Addon>(
        r#"
        UPDATE addons SET status = 'ready', connection = $2, updated_at = now()
        WHERE id = $1 AND status = 'provisioning'
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&connection)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(addon) => Ok(addon),
        None => Err(conflict(pool, id, status::READY).await),
    }
}

pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<Addon, StoreError> {
    let updated = sqlx::query_as::<_, Addon>(
        r#"
        UPDATE addons SET status = 'failed', error_message = $2, updated_at = now()
        WHERE id = $1 AND status IN ('pending', 'provisioning')
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(error)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(addon) => Ok(addon),
        None => Err(conflict(pool, id, status::FAILED).await),
    }
}

/// Begin deletion. Refused while service bindings reference the addon.
pub async fn start_deleting(pool: &PgPool, id: Uuid) -> Result<Addon, StoreError> {
    let mut tx = pool.begin().await?;

    let binding_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM addon_bindings WHERE addon_id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

    if binding_count > 0 {
        return Err(StoreError::Conflict(
            "addon is still bound to services".into(),
        ));
    }

    let updated = sqlx::query_as::<_, Addon>(
        r#"
        UPDATE addons SET status = 'deleting', updated_at = now()
        WHERE id = $1 AND status IN ('ready', 'failed', 'pending')
        RETURNING *
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(addon) = updated else {
        tx.rollback().await?;
        return Err(conflict(pool, id, status::DELETING).await);
    };

    tx.commit().await?;
    Ok(addon)
}

pub async fn mark_deleted(pool: &PgPool, id: Uuid) -> Result<Addon, StoreError> {
    guarded(pool, id, status::DELETING, status::DELETED).await
}

async fn guarded(pool: &PgPool, id: Uuid, from: &str, to: &str) -> Result<Addon, StoreError> {
    let updated = sqlx::query_as::<_, Addon>(
        r#"
        UPDATE addons SET status = $3, updated_at = now()
        WHERE id = $1 AND status = $2
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(addon) => Ok(addon),
        None => Err(conflict(pool, id, to).await),
    }
}

async fn conflict(pool: &PgPool, id: Uuid, target: &str) -> StoreError {
    match get(pool, id).await {
        Ok(addon) => StoreError::Conflict(format!(
            "addon {} cannot transition {} -> {}",
            id, addon.status, target
        )),
        Err(e) => e,
    }
}

// ---------------------------------------------------------------------------
// Bindings (service ↔ addon join)
// ---------------------------------------------------------------------------

pub async fn bind(
    pool: &PgPool,
    addon_id: Uuid,
    service_id: Uuid,
    env_prefix: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO addon_bindings (addon_id, service_id, env_prefix)
        VALUES ($1, $2, $3)
        ON CONFLICT (addon_id, service_id) DO NOTHING
        "#,
    )
    .bind(addon_id)
    .bind(service_id)
    .bind(env_prefix)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn unbind(pool: &PgPool, addon_id: Uuid, service_id: Uuid) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM addon_bindings WHERE addon_id = $1 AND service_id = $2")
        .bind(addon_id)
        .bind(service_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound("addon binding".into()));
    }
    Ok(())
}
