use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::AuditOverloadPolicy;

/// One authenticated mutation, appended asynchronously.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<Uuid>,
    pub outcome: String,
    pub metadata: Option<serde_json::Value>,
}

/// The channel was full and the action is compliance-tagged under
/// `fail_closed`: the API operation must fail rather than lose the record.
#[derive(Debug, thiserror::Error)]
#[error("audit buffer full; refusing to drop compliance record for {action}")]
pub struct AuditOverflow {
    pub action: String,
}

/// Handle for offering events to the bounded audit channel. Cheap to clone;
/// the writer task drains the receiving side into the store.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditEvent>,
    policy: AuditOverloadPolicy,
    compliance_actions: Arc<HashSet<String>>,
    dropped: Arc<AtomicU64>,
}

impl AuditLog {
    pub fn new(
        capacity: usize,
        policy: AuditOverloadPolicy,
        compliance_actions: HashSet<String>,
    ) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                policy,
                compliance_actions: Arc::new(compliance_actions),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Offer an event without blocking the caller. Under sustained overload:
    /// compliance-tagged actions fail closed (when configured), everything
    /// else is dropped and counted.
    pub fn record(&self, event: AuditEvent) -> Result<(), AuditOverflow> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event))
            | Err(mpsc::error::TrySendError::Closed(event)) => {
                let compliance = self.compliance_actions.contains(&event.action);
                if compliance && self.policy == AuditOverloadPolicy::FailClosed {
                    return Err(AuditOverflow {
                        action: event.action,
                    });
                }

                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(total_dropped = dropped, "audit events dropped under overload");
                }
                Ok(())
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Writer task: drains the channel into `audit_events`. On shutdown the
/// channel closes and the remaining buffered events are flushed.
pub async fn run_writer(pool: PgPool, mut rx: mpsc::Receiver<AuditEvent>) {
    tracing::info!("audit writer started");

    while let Some(event) = rx.recv().await {
        write_event(&pool, &event).await;
    }

    tracing::info!("audit writer stopped");
}

async fn write_event(pool: &PgPool, event: &AuditEvent) {
    let result = sqlx::query(
        r#"
        INSERT INTO audit_events (actor, action, resource, resource_id, outcome, metadata)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&event.actor)
    .bind(&event.action)
    .bind(&event.resource)
    .bind(event.resource_id)
    .bind(&event.outcome)
    .bind(&event.metadata)
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::error!(error = %e, action = %event.action, "failed to persist audit event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(action: &str) -> AuditEvent {
        AuditEvent {
            actor: "tester".into(),
            action: action.into(),
            resource: "release".into(),
            resource_id: None,
            outcome: "ok".into(),
            metadata: None,
        }
    }

    fn compliance_set() -> HashSet<String> {
        ["deployment.rollback".to_owned()].into_iter().collect()
    }

    #[test]
    fn records_until_full_then_drops_with_counter() {
        let (log, _rx) = AuditLog::new(2, AuditOverloadPolicy::DropWithCounter, compliance_set());

        assert!(log.record(event("release.create")).is_ok());
        assert!(log.record(event("release.create")).is_ok());
        // Buffer full, nobody draining: drop-with-counter accepts silently.
        assert!(log.record(event("release.create")).is_ok());
        assert_eq!(log.dropped(), 1);
    }

    #[test]
    fn fail_closed_rejects_compliance_action_on_overflow() {
        let (log, _rx) = AuditLog::new(1, AuditOverloadPolicy::FailClosed, compliance_set());

        assert!(log.record(event("deployment.rollback")).is_ok());
        let err = log.record(event("deployment.rollback")).unwrap_err();
        assert_eq!(err.action, "deployment.rollback");
        assert_eq!(log.dropped(), 0);
    }

    #[test]
    fn fail_closed_still_drops_low_tier_actions() {
        let (log, _rx) = AuditLog::new(1, AuditOverloadPolicy::FailClosed, compliance_set());

        assert!(log.record(event("release.create")).is_ok());
        assert!(log.record(event("release.create")).is_ok());
        assert_eq!(log.dropped(), 1);
    }

    #[tokio::test]
    async fn drained_channel_accepts_again() {
        let (log, mut rx) = AuditLog::new(1, AuditOverloadPolicy::FailClosed, compliance_set());

        assert!(log.record(event("deployment.rollback")).is_ok());
        assert!(log.record(event("deployment.rollback")).is_err());

        rx.recv().await.unwrap();
        assert!(log.record(event("deployment.rollback")).is_ok());
    }
}
