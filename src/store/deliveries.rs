use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::StoreError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub forge: String,
    pub forge_id: String,
    pub event_type: String,
    pub payload_hash: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

/// Result of attempting to record a delivery.
#[derive(Debug)]
pub enum RecordOutcome {
    /// First time this forge id was seen; process the event.
    Recorded(WebhookDelivery),
    /// Already recorded; the forge re-delivered. Acknowledge and drop.
    Duplicate,
}

/// Insert-once on `(forge, forge_id)`. Re-delivery is observed, not an error.
/// Runs inside the ingestor's transaction so the delivery row commits (or
/// rolls back) together with the releases and outbox rows it produced.
pub async fn record_once(
    conn: &mut PgConnection,
    forge: &str,
    forge_id: &str,
    event_type: &str,
    payload_hash: &str,
) -> Result<RecordOutcome, StoreError> {
    let inserted = sqlx::query_as::<_, WebhookDelivery>(
        r#"
        INSERT INTO webhook_deliveries (forge, forge_id, event_type, payload_hash)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (forge, forge_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(forge)
    .bind(forge_id)
    .bind(event_type)
    .bind(payload_hash)
    .fetch_optional(conn)
    .await?;

    Ok(match inserted {
        Some(delivery) => RecordOutcome::Recorded(delivery),
        None => RecordOutcome::Duplicate,
    })
}

/// Set the processing outcome once event mapping finishes.
pub async fn mark_processed(
    conn: &mut PgConnection,
    id: Uuid,
    outcome: &str,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE webhook_deliveries SET processed_at = now(), outcome = $2 WHERE id = $1")
        .bind(id)
        .bind(outcome)
        .execute(conn)
        .await?;

    Ok(())
}

/// Retention sweep: prune processed deliveries past the audit window and old
/// dispatched outbox rows. Runs hourly until shutdown.
pub async fn run_retention(
    pool: PgPool,
    retention_days: i64,
    mut shutdown: tokio::sync::watch::Receiver<()>,
) {
    tracing::info!(retention_days, "delivery retention sweeper started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("delivery retention sweeper shutting down");
                break;
            }
            () = tokio::time::sleep(std::time::Duration::from_secs(3600)) => {
                match prune_older_than(&pool, retention_days).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(pruned = n, "webhook deliveries pruned"),
                    Err(e) => tracing::error!(error = %e, "delivery pruning failed"),
                }
                match super::outbox::prune_dispatched(&pool, 24).await {
                    Ok(0) | Err(_) => {}
                    Ok(n) => tracing::info!(pruned = n, "dispatched outbox rows pruned"),
                }
            }
        }
    }
}

/// Prune deliveries past the audit retention window. Invoked from a
/// maintenance tick; returns the number of rows removed.
pub async fn prune_older_than(pool: &PgPool, retention_days: i64) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        DELETE FROM webhook_deliveries
        WHERE processed_at IS NOT NULL
          AND received_at < now() - make_interval(days => $1::int)
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
