use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Cursor, Page, StoreError};

/// Deployment lifecycle: `pending → deploying → running → stopped`, with
/// `failed` reachable from any non-terminal state.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const DEPLOYING: &str = "deploying";
    pub const RUNNING: &str = "running";
    pub const FAILED: &str = "failed";
    pub const STOPPED: &str = "stopped";

    pub fn is_terminal(status: &str) -> bool {
        matches!(status, FAILED | STOPPED)
    }
}

pub mod health {
    pub const HEALTHY: &str = "healthy";
    pub const UNHEALTHY: &str = "unhealthy";
    pub const UNKNOWN: &str = "unknown";
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Deployment {
    pub id: Uuid,
    pub release_id: Uuid,
    pub service_id: Uuid,
    pub environment_id: Uuid,
    pub replicas: i32,
    pub status: String,
    pub health: String,
    pub ready_replicas: i32,
    pub error_message: Option<String>,
    pub requires_ack: bool,
    pub running_since: Option<DateTime<Utc>>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub cleaned_up: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Promote a ready release into an environment. The partial unique index on
/// non-stopped rollouts turns a concurrent promote into `Conflict`.
pub async fn create(
    pool: &PgPool,
    release_id: Uuid,
    service_id: Uuid,
    environment_id: Uuid,
    replicas: i32,
) -> Result<Deployment, StoreError> {
    let deployment = sqlx::query_as::<_, Deployment>(
        r#"
        INSERT INTO deployments (release_id, service_id, environment_id, replicas)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(release_id)
    .bind(service_id)
    .bind(environment_id)
    .bind(replicas)
    .fetch_one(pool)
    .await?;

    Ok(deployment)
}

/// Promote while an older rollout may still be in flight: any pending or
/// deploying deployment of the same (service, environment) is stopped first,
/// in the same transaction, so the new rollout wins and the one-rollout
/// invariant holds. Deployments of a pair therefore transition in creation
/// order.
pub async fn create_superseding(
    pool: &PgPool,
    release_id: Uuid,
    service_id: Uuid,
    environment_id: Uuid,
    replicas: i32,
) -> Result<Deployment, StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE deployments SET status = 'stopped', superseded_at = now(), updated_at = now()
        WHERE service_id = $1 AND environment_id = $2 AND status IN ('pending', 'deploying')
        "#,
    )
    .bind(service_id)
    .bind(environment_id)
    .execute(&mut *tx)
    .await?;

    let deployment = sqlx::query_as::<_, Deployment>(
        r#"
        INSERT INTO deployments (release_id, service_id, environment_id, replicas)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(release_id)
    .bind(service_id)
    .bind(environment_id)
    .bind(replicas)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(deployment)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Deployment, StoreError> {
    sqlx::query_as::<_, Deployment>("SELECT * FROM deployments WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("deployment".into()))
}

/// Latest deployment for a release — the aggregator's deploy stage.
pub async fn latest_for_release(
    pool: &PgPool,
    release_id: Uuid,
) -> Result<Option<Deployment>, StoreError> {
    let deployment = sqlx::query_as::<_, Deployment>(
        r#"
        SELECT * FROM deployments
        WHERE release_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(release_id)
    .fetch_optional(pool)
    .await?;

    Ok(deployment)
}

pub async fn list_for_service(
    pool: &PgPool,
    service_id: Uuid,
    cursor: Option<Cursor>,
    limit: i64,
) -> Result<Page<Deployment>, StoreError> {
    let rows = match cursor {
        Some(c) => {
            sqlx::query_as::<_, Deployment>(
                r#"
                SELECT * FROM deployments
                WHERE service_id = $1 AND (created_at, id) < ($2, $3)
                ORDER BY created_at DESC, id DESC
                LIMIT $4
                "#,
            )
            .bind(service_id)
            .bind(c.created_at)
            .bind(c.id)
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Deployment>(
                r#"
                SELECT * FROM deployments
                WHERE service_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2
                "#,
            )
            .bind(service_id)
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(Page::from_rows(rows, limit, |d| Cursor {
        created_at: d.created_at,
        id: d.id,
    }))
}

/// Rows the deployment reconciler needs to act on: active rollouts, running
/// deployments (observation), and superseded rows awaiting cluster cleanup.
pub async fn list_reconcilable(pool: &PgPool) -> Result<Vec<Deployment>, StoreError> {
    let rows = sqlx::query_as::<_, Deployment>(
        r#"
        SELECT * FROM deployments
        WHERE (status IN ('pending', 'deploying', 'running') AND requires_ack = false)
           OR (status = 'stopped' AND cleaned_up = false)
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Services that have any deployment rows at all; the routing reconcilers key
/// on these.
pub async fn service_ids_with_deployments(pool: &PgPool) -> Result<Vec<Uuid>, StoreError> {
    let ids: Vec<Uuid> = sqlx::query_scalar("SELECT DISTINCT service_id FROM deployments")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

pub async fn running_for_service(
    pool: &PgPool,
    service_id: Uuid,
) -> Result<Vec<Deployment>, StoreError> {
    let rows = sqlx::query_as::<_, Deployment>(
        "SELECT * FROM deployments WHERE service_id = $1 AND status = 'running'",
    )
    .bind(service_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Live rows pointing at the same release in the same environment. The
/// cleanup pass checks this before deleting a superseded cluster object:
/// re-promoting a release reuses the object name, and deleting it would pull
/// the rug from under the active rollout.
pub async fn live_rows_for_release(
    pool: &PgPool,
    service_id: Uuid,
    environment_id: Uuid,
    release_id: Uuid,
) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM deployments
        WHERE service_id = $1 AND environment_id = $2 AND release_id = $3
          AND status IN ('pending', 'deploying', 'running')
        "#,
    )
    .bind(service_id)
    .bind(environment_id)
    .bind(release_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Everything the tunnel-route reconciler needs to render one route entry.
#[derive(Debug, sqlx::FromRow)]
pub struct RunningRoute {
    pub service_name: String,
    pub project_slug: String,
    pub env_name: String,
    pub namespace: String,
    pub hostname_template: String,
    pub port: i32,
}

pub async fn running_routes(pool: &PgPool) -> Result<Vec<RunningRoute>, StoreError> {
    let rows = sqlx::query_as::<_, RunningRoute>(
        r#"
        SELECT s.name AS service_name, p.slug AS project_slug,
               e.name AS env_name, e.namespace, e.hostname_template, s.port
        FROM deployments d
        JOIN services s ON s.id = d.service_id AND s.is_active = true
        JOIN environments e ON e.id = d.environment_id
        JOIN projects p ON p.id = s.project_id AND p.is_active = true
        WHERE d.status = 'running'
        ORDER BY p.slug, s.name, e.name
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Guarded transitions
// ---------------------------------------------------------------------------

/// `pending → deploying`, claimed by the reconciler.
pub async fn start_deploy(pool: &PgPool, id: Uuid) -> Result<Deployment, StoreError> {
    guarded(pool, id, status::PENDING, status::DEPLOYING).await
}

async fn guarded(pool: &PgPool, id: Uuid, from: &str, to: &str) -> Result<Deployment, StoreError> {
    let updated = sqlx::query_as::<_, Deployment>(
        r#"
        UPDATE deployments SET status = $3, updated_at = now()
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
        Some(d) => Ok(d),
        None => Err(conflict(pool, id, to).await),
    }
}

/// `deploying → running`, superseding the previous running deployment of the
/// same (service, environment) in the same transaction so the one-running
/// invariant holds at the commit boundary. The superseded row keeps its
/// cluster object until the cleanup grace window elapses.
pub async fn mark_running(pool: &PgPool, id: Uuid) -> Result<Deployment, StoreError> {
    let mut tx = pool.begin().await?;

    let superseded: Vec<Uuid> = sqlx::query_scalar(
        r#"
        UPDATE deployments SET
            status = 'stopped', superseded_at = now(), updated_at = now()
        WHERE status = 'running'
          AND id != $1
          AND (service_id, environment_id) =
              (SELECT service_id, environment_id FROM deployments WHERE id = $1)
          -- never let an older deployment supersede a newer one
          AND created_at < (SELECT created_at FROM deployments WHERE id = $1)
        RETURNING id
        "#,
    )
    .bind(id)
    .fetch_all(&mut *tx)
    .await?;

    let updated = sqlx::query_as::<_, Deployment>(
        r#"
        UPDATE deployments SET
            status = 'running', health = 'healthy', running_since = now(), updated_at = now()
        WHERE id = $1 AND status = 'deploying'
        RETURNING *
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(deployment) = updated else {
        tx.rollback().await?;
        return Err(conflict(pool, id, status::RUNNING).await);
    };

    tx.commit().await?;

    for old in superseded {
        tracing::info!(deployment_id = %old, superseded_by = %id, "deployment superseded");
    }

    Ok(deployment)
}

/// Failure from any non-terminal state. `requires_ack` stops retries until a
/// human acknowledges (quota rejections).
pub async fn mark_failed(
    pool: &PgPool,
    id: Uuid,
    error_message: &str,
    requires_ack: bool,
) -> Result<Deployment, StoreError> {
    let updated = sqlx::query_as::<_, Deployment>(
        r#"
        UPDATE deployments SET
            status = 'failed', health = 'unhealthy', error_message = $2,
            requires_ack = $3, updated_at = now()
        WHERE id = $1 AND status IN ('pending', 'deploying', 'running')
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(error_message)
    .bind(requires_ack)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(d) => Ok(d),
        None => Err(conflict(pool, id, status::FAILED).await),
    }
}

/// Observed-state writeback from the cluster watch. Not a state transition;
/// only refreshes `ready_replicas` and `health`.
pub async fn observe(
    pool: &PgPool,
    id: Uuid,
    ready_replicas: i32,
    health: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE deployments SET ready_replicas = $2, health = $3, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(ready_replicas)
    .bind(health)
    .execute(pool)
    .await?;

    Ok(())
}

/// The superseded cluster object has been removed; stop reconciling this row.
pub async fn mark_cleaned_up(pool: &PgPool, id: Uuid) -> Result<(), StoreError> {
    sqlx::query("UPDATE deployments SET cleaned_up = true, updated_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Human acknowledgment of a quota-rejected deployment: clear the flag and
/// return the row to `pending` so the reconciler retries it.
pub async fn acknowledge_failure(pool: &PgPool, id: Uuid) -> Result<Deployment, StoreError> {
    sqlx::query_as::<_, Deployment>(
        r#"
        UPDATE deployments SET
            status = 'pending', requires_ack = false, error_message = NULL, updated_at = now()
        WHERE id = $1 AND requires_ack = true AND status = 'failed'
        RETURNING *
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound("deployment awaiting acknowledgment".into()))
}

async fn conflict(pool: &PgPool, id: Uuid, target: &str) -> StoreError {
    match get(pool, id).await {
        Ok(d) => StoreError::Conflict(format!(
            "deployment {} cannot transition {} -> {}",
            id, d.status, target
        )),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(status::is_terminal("stopped"));
        assert!(status::is_terminal("failed"));
        assert!(!status::is_terminal("pending"));
        assert!(!status::is_terminal("deploying"));
        assert!(!status::is_terminal("running"));
    }
}
