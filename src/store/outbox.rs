use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::StoreError;

/// Outbox row kinds.
pub const KIND_ENQUEUE_BUILD: &str = "enqueue_build";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

/// Write an outbox row inside the caller's transaction. Pairing this with the
/// domain change makes change + enqueue atomic; the dispatcher delivers it
/// at-least-once and the queue's idempotent enqueue absorbs replays.
pub async fn push(
    conn: &mut PgConnection,
    kind: &str,
    payload: &serde_json::Value,
) -> Result<Uuid, StoreError> {
    let id: Uuid =
        sqlx::query_scalar("INSERT INTO outbox (kind, payload) VALUES ($1, $2) RETURNING id")
            .bind(kind)
            .bind(payload)
            .fetch_one(conn)
            .await?;

    Ok(id)
}

/// Claim a batch of undispatched rows. `FOR UPDATE SKIP LOCKED` lets multiple
/// dispatcher instances coexist without double-delivery in the common case.
pub async fn claim_batch(conn: &mut PgConnection, limit: i64) -> Result<Vec<OutboxRow>, StoreError> {
    let rows = sqlx::query_as::<_, OutboxRow>(
        r#"
        SELECT * FROM outbox
        WHERE dispatched_at IS NULL
        ORDER BY created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

pub async fn mark_dispatched(conn: &mut PgConnection, id: Uuid) -> Result<(), StoreError> {
    sqlx::query("UPDATE outbox SET dispatched_at = now() WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;

    Ok(())
}

/// Drain the outbox into the work queue until shutdown. Ticks as a fallback;
/// the ingestor's notify wakes it immediately after a commit. Delivery is
/// at-least-once: a crash between enqueue and mark leaves the row to be
/// re-dispatched, and the queue's idempotent enqueue absorbs the replay.
pub async fn run_dispatcher(
    state: crate::store::AppState,
    queue: crate::queue::WorkQueue,
    mut shutdown: tokio::sync::watch::Receiver<()>,
) {
    tracing::info!("outbox dispatcher started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("outbox dispatcher shutting down");
                break;
            }
            () = state.outbox_notify.notified() => {}
            () = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
        }

        if let Err(e) = dispatch_batch(&state, &queue).await {
            tracing::error!(error = %e, "outbox dispatch failed");
        }
    }
}

async fn dispatch_batch(
    state: &crate::store::AppState,
    queue: &crate::queue::WorkQueue,
) -> Result<(), StoreError> {
    loop {
        let mut tx = state.pool.begin().await?;
        let rows = claim_batch(&mut tx, 50).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut deferred = 0usize;
        for row in &rows {
            match row.kind.as_str() {
                KIND_ENQUEUE_BUILD => {
                    let (Some(release_id), Some(service_id)) = (
                        row.payload.get("release_id").and_then(as_uuid),
                        row.payload.get("service_id").and_then(as_uuid),
                    ) else {
                        tracing::error!(outbox_id = %row.id, "malformed outbox payload dropped");
                        mark_dispatched(&mut tx, row.id).await?;
                        continue;
                    };

                    let job = crate::queue::BuildJob::new(release_id, service_id);
                    match queue.enqueue(&job).await {
                        Ok(fresh) => {
                            if fresh {
                                tracing::info!(%release_id, "build job enqueued");
                            }
                            mark_dispatched(&mut tx, row.id).await?;
                        }
                        Err(e) => {
                            // Queue down: leave the row for the next tick.
                            tracing::warn!(error = %e, %release_id, "enqueue failed, will retry");
                            deferred += 1;
                        }
                    }
                }
                other => {
                    tracing::error!(outbox_id = %row.id, kind = other, "unknown outbox kind dropped");
                    mark_dispatched(&mut tx, row.id).await?;
                }
            }
        }

        tx.commit().await?;

        // Deferred rows stay claimed-and-unmarked; re-claiming them in a hot
        // loop while the queue is down helps nobody.
        if deferred > 0 {
            return Ok(());
        }
    }
}

fn as_uuid(value: &serde_json::Value) -> Option<Uuid> {
    value.as_str().and_then(|s| s.parse().ok())
}

/// Dispatched rows are kept briefly for debugging, then pruned.
pub async fn prune_dispatched(pool: &PgPool, older_than_hours: i64) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        DELETE FROM outbox
        WHERE dispatched_at IS NOT NULL
          AND dispatched_at < now() - make_interval(hours => $1::int)
        "#,
    )
    .bind(older_than_hours)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
