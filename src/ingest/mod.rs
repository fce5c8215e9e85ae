pub mod event;
pub mod signature;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use uuid::Uuid;

use crate::api::helpers::record_audit;
use crate::audit::AuditEvent;
use crate::auth::middleware::ClientIp;
use crate::auth::rate_limit;
use crate::error::ApiError;
use crate::store::deliveries::RecordOutcome;
use crate::store::{AppState, StoreError, deliveries, outbox, projects, releases};

use event::{EventKind, ForgeEvent, ParseOutcome};

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/{forge}", post(ingest))
}

/// Accept a forge delivery: authenticate, deduplicate, map to releases,
/// stage build jobs through the outbox. Everything the event produces commits
/// in one transaction, so a transient failure rolls back cleanly and the
/// forge's retry re-processes from scratch.
#[tracing::instrument(skip(state, headers, body), fields(%forge), err)]
async fn ingest(
    State(state): State<AppState>,
    Path(forge): Path<String>,
    ip: ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if !matches!(forge.as_str(), "github" | "gitlab" | "bitbucket") {
        return Err(ApiError::NotFound("unknown forge".into()));
    }

    rate_limit::check_ip(
        &state.valkey,
        rate_limit::RateScope::Webhook,
        ip.0.as_deref(),
        state.config.rate_limit_per_ip,
    )
    .await?;

    // Authentication precedes everything; a mismatch records no delivery.
    verify_signature(&state, &forge, &headers, &body)?;

    let Some(delivery_id) = delivery_id(&forge, &headers) else {
        return Err(ApiError::BadRequest("missing delivery id header".into()));
    };
    let Some(event_name) = event_name(&forge, &headers) else {
        return Err(ApiError::BadRequest("missing event type header".into()));
    };

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("payload is not valid JSON".into()))?;

    let mut tx = state
        .pool
        .begin()
        .await
        .map_err(|e| ApiError::from(StoreError::from(e)))?;

    let delivery = match deliveries::record_once(
        &mut tx,
        &forge,
        &delivery_id,
        &event_name,
        &signature::payload_hash(&body),
    )
    .await?
    {
        RecordOutcome::Recorded(delivery) => delivery,
        RecordOutcome::Duplicate => {
            // Fail closed: a refused compliance record turns into 503 and the
            // forge redelivers, rather than acknowledging unrecorded.
            record_audit(
                &state,
                AuditEvent {
                    actor: format!("forge:{forge}"),
                    action: "webhook.duplicate_delivery".into(),
                    resource: "webhook_delivery".into(),
                    resource_id: None,
                    outcome: "ignored".into(),
                    metadata: Some(serde_json::json!({ "forge_id": delivery_id })),
                },
            )?;
            tx.commit().await.map_err(StoreError::from)?;
            tracing::info!(%delivery_id, "duplicate delivery ignored");
            return Ok((
                StatusCode::OK,
                axum::Json(serde_json::json!({"ok": true, "duplicate": true})),
            ));
        }
    };

    let parsed = match forge.as_str() {
        "github" => event::parse_github(&event_name, &payload),
        "gitlab" => event::parse_gitlab(&event_name, &payload),
        _ => event::parse_bitbucket(&event_name, &payload),
    };

    let (outcome, release_ids) = match parsed {
        ParseOutcome::Ignored(reason) => (format!("ignored: {reason}"), Vec::new()),
        ParseOutcome::Malformed(reason) => {
            deliveries::mark_processed(&mut tx, delivery.id, "malformed").await?;
            tx.commit().await.map_err(StoreError::from)?;
            return Err(ApiError::BadRequest(reason.into()));
        }
        ParseOutcome::Relevant(event) => {
            let ids = map_to_releases(&mut tx, &state, &event).await?;
            (format!("processed: {} release(s)", ids.len()), ids)
        }
    };

    deliveries::mark_processed(&mut tx, delivery.id, &outcome).await?;
    tx.commit().await.map_err(StoreError::from)?;

    // Wake the outbox dispatcher so builds start without waiting for a tick.
    if !release_ids.is_empty() {
        state.outbox_notify.notify_one();
    }

    Ok((
        StatusCode::OK,
        axum::Json(serde_json::json!({"ok": true, "releases": release_ids})),
    ))
}

/// Create a pending release plus its enqueue-outbox row for every service
/// whose repo and branch policy match the event. Runs inside the delivery
/// transaction. A `(service, version)` race aborts the transaction; the
/// caller surfaces 503 and the forge's retry wins cleanly.
async fn map_to_releases(
    tx: &mut sqlx::PgConnection,
    state: &AppState,
    event: &ForgeEvent,
) -> Result<Vec<Uuid>, ApiError> {
    let matches = services_matching(state, event).await?;
    let mut release_ids = Vec::new();

    for m in matches {
        let release = releases::create_next(tx, m.service_id, &event.commit_sha, &event.branch)
            .await
            .map_err(|e| match e {
                // Concurrent version allocation; retryable by the forge.
                StoreError::Conflict(msg) => ApiError::ServiceUnavailable(msg),
                other => other.into(),
            })?;

        outbox::push(
            tx,
            outbox::KIND_ENQUEUE_BUILD,
            &serde_json::json!({
                "release_id": release.id,
                "service_id": m.service_id,
            }),
        )
        .await?;

        // Propagated: a refused record aborts the whole delivery transaction,
        // so no release is committed without its audit entry.
        record_audit(
            state,
            AuditEvent {
                actor: event
                    .pusher
                    .clone()
                    .unwrap_or_else(|| format!("forge:{}", event.repo_url)),
                action: "release.create".into(),
                resource: "release".into(),
                resource_id: Some(release.id),
                outcome: "ok".into(),
                metadata: Some(serde_json::json!({
                    "version": release.version,
                    "git_sha": event.commit_sha,
                    "event": event.kind.as_str(),
                })),
            },
        )?;

        tracing::info!(
            release_id = %release.id,
            service_id = %m.service_id,
            version = release.version,
            "release created from webhook"
        );
        release_ids.push(release.id);
    }

    Ok(release_ids)
}

/// Branch policy: pushes build only on the service's build branch (or the
/// project default); pull-request events always build the head commit.
async fn services_matching(
    state: &AppState,
    event: &ForgeEvent,
) -> Result<Vec<projects::RepoMatch>, ApiError> {
    let all = projects::services_for_repo(&state.pool, &event.repo_url).await?;

    if event.kind.is_pull_request() {
        return Ok(all);
    }

    Ok(all
        .into_iter()
        .filter(|m| match &m.build_branch {
            Some(b) => *b == event.branch,
            None => event.branch == m.default_branch,
        })
        .collect())
}

fn verify_signature(
    state: &AppState,
    forge: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let ok = match forge {
        "github" => state.config.github_webhook_secret.as_deref().is_some_and(
            |secret| matches!(header("x-hub-signature-256"), Some(sig) if signature::verify_hmac_sha256(secret, body, sig)),
        ),
        "gitlab" => state.config.gitlab_webhook_secret.as_deref().is_some_and(
            |secret| matches!(header("x-gitlab-token"), Some(token) if signature::tokens_match(secret, token)),
        ),
        _ => state.config.bitbucket_webhook_secret.as_deref().is_some_and(
            |secret| matches!(header("x-hub-signature"), Some(sig) if signature::verify_hmac_sha256(secret, body, sig)),
        ),
    };

    if ok { Ok(()) } else { Err(ApiError::Unauthorized) }
}

fn delivery_id(forge: &str, headers: &HeaderMap) -> Option<String> {
    let name = match forge {
        "github" => "x-github-delivery",
        "gitlab" => "x-gitlab-event-uuid",
        _ => "x-request-uuid",
    };
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

fn event_name(forge: &str, headers: &HeaderMap) -> Option<String> {
    let name = match forge {
        "github" => "x-github-event",
        "gitlab" => "x-gitlab-event",
        _ => "x-event-key",
    };
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*k).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn delivery_id_per_forge() {
        let h = headers(&[("x-github-delivery", "d-1")]);
        assert_eq!(delivery_id("github", &h), Some("d-1".into()));

        let h = headers(&[("x-gitlab-event-uuid", "d-2")]);
        assert_eq!(delivery_id("gitlab", &h), Some("d-2".into()));

        let h = headers(&[("x-request-uuid", "d-3")]);
        assert_eq!(delivery_id("bitbucket", &h), Some("d-3".into()));

        assert_eq!(delivery_id("github", &HeaderMap::new()), None);
    }

    #[test]
    fn empty_delivery_id_rejected() {
        let h = headers(&[("x-github-delivery", "")]);
        assert_eq!(delivery_id("github", &h), None);
    }

    #[test]
    fn event_name_per_forge() {
        let h = headers(&[("x-github-event", "push")]);
        assert_eq!(event_name("github", &h), Some("push".into()));

        let h = headers(&[("x-event-key", "repo:push")]);
        assert_eq!(event_name("bitbucket", &h), Some("repo:push".into()));
    }
}
