use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditEvent;
use crate::queue::{AckOutcome, BuildJob, WorkQueue};
use crate::store::{AppState, StoreError, deployments, environments, projects, releases, services};

use super::artifacts;
use super::builder::{self, BuildError, BuildRequest};
use super::logbuf::{LogBuffer, LogFrame};
use super::single_flight::SingleFlight;
use super::workspace::{self, SourceError};

/// Idle poll interval when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Retry delay when the service's single-flight lock is held: roughly one
/// lock-hold, so the older job finishes first and FIFO within the service is
/// preserved without head-of-line blocking across services.
const LOCK_RETRY: Duration = Duration::from_secs(15);

/// Exponential backoff base and cap for transient infrastructure failures.
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(600);

/// Worker pool: reserve jobs, run builds, drive the release state machine.
pub async fn run(
    state: AppState,
    queue: WorkQueue,
    shutdown: tokio::sync::watch::Receiver<()>,
) {
    let single_flight = SingleFlight::default();
    let worker_count = state.config.build_worker_count;
    tracing::info!(workers = worker_count, "build dispatcher started");

    let mut workers = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        workers.push(tokio::spawn(worker_loop(
            state.clone(),
            queue.clone(),
            single_flight.clone(),
            worker_id,
            shutdown.clone(),
        )));
    }

    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("build dispatcher stopped");
}

async fn worker_loop(
    state: AppState,
    queue: WorkQueue,
    single_flight: SingleFlight,
    worker_id: usize,
    mut shutdown: tokio::sync::watch::Receiver<()>,
) {
    let mut shutting_down = false;

    while !shutting_down {
        tokio::select! {
            _ = shutdown.changed() => { shutting_down = true; }
            () = tokio::time::sleep(POLL_INTERVAL) => {
                loop {
                    let visibility = Duration::from_secs(state.config.visibility_timeout_secs);
                    match queue.reserve(visibility).await {
                        Ok(Some(job)) => {
                            // In-flight jobs are never cancelled mid-build;
                            // shutdown drains the current job, then exits.
                            process(&state, &queue, &single_flight, job).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(error = %e, worker_id, "queue reserve failed");
                            break;
                        }
                    }
                    if shutdown.has_changed().unwrap_or(true) {
                        shutting_down = true;
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(worker_id, "build worker stopped");
}

/// Drive one reserved job to ack, nack, or dead-letter.
#[tracing::instrument(skip(state, queue, single_flight, job), fields(release_id = %job.release_id, attempt = job.attempt))]
async fn process(state: &AppState, queue: &WorkQueue, single_flight: &SingleFlight, job: BuildJob) {
    // Two releases of the same service never build concurrently. The older
    // holder wins; this job comes back after roughly one lock-hold, and
    // waiting for the lock never consumes retry budget.
    let Some(_guard) = single_flight.try_acquire(job.service_id) else {
        defer_job(queue, &job, LOCK_RETRY).await;
        return;
    };

    if job.attempt > state.config.build_retry_cap {
        dead_letter(state, queue, &job).await;
        return;
    }

    // Replay safety: a terminal release means a previous attempt finished
    // and its ack was lost. Ack and move on.
    let release = match releases::get(&state.pool, job.release_id).await {
        Ok(release) => release,
        Err(StoreError::NotFound(_)) => {
            tracing::warn!(release_id = %job.release_id, "job for unknown release dropped");
            ack_job(queue, &job).await;
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "release load failed");
            nack_job(queue, &job, retry_backoff(job.attempt)).await;
            return;
        }
    };

    if release.is_terminal() {
        ack_job(queue, &job).await;
        return;
    }

    let release = match releases::start_build(&state.pool, release.id).await {
        Ok(release) => release,
        Err(StoreError::Conflict(_)) => {
            // Re-read: either another attempt finished it (ack-drop) or a
            // previous worker died mid-build and we take over. Holding the
            // single-flight key guarantees nobody in this process is still
            // building it.
            match releases::get(&state.pool, job.release_id).await {
                Ok(r) if r.is_terminal() => {
                    ack_job(queue, &job).await;
                    return;
                }
                Ok(r) if r.status == releases::status::BUILDING => {
                    tracing::info!(release_id = %r.id, "taking over interrupted build");
                    r
                }
                _ => {
                    nack_job(queue, &job, retry_backoff(job.attempt)).await;
                    return;
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "pending->building transition failed");
            nack_job(queue, &job, retry_backoff(job.attempt)).await;
            return;
        }
    };

    let logbuf = state.log_bufs.create(release.id);
    let result = execute(state, &release, &logbuf).await;

    // Persist whatever the build produced, success or failure, so historical
    // log streams work.
    let log_path = artifacts::build_log_path(release.id);
    if let Err(e) = state
        .artifacts
        .write(&log_path, logbuf.render_text().into_bytes())
        .await
    {
        tracing::warn!(error = %e, "failed to persist build log");
    }
    state.log_bufs.remove(release.id);

    match result {
        Ok(()) => {
            ack_job(queue, &job).await;
        }
        Err(BuildError::Deterministic(message)) => {
            // Not retried, but the audit record must land before the failure
            // is committed and the job consumed; a refused record (buffer
            // full, fail-closed) nacks the job so a later attempt records it.
            let recorded = state.audit.record(AuditEvent {
                actor: "build-dispatcher".into(),
                action: "release.build_failed".into(),
                resource: "release".into(),
                resource_id: Some(release.id),
                outcome: "failed".into(),
                metadata: Some(serde_json::json!({ "error": releases::truncate_error(&message) })),
            });
            if let Err(e) = recorded {
                tracing::warn!(error = %e, release_id = %release.id, "audit refused, retrying job");
                nack_job(queue, &job, retry_backoff(job.attempt)).await;
                return;
            }

            if let Err(e) = releases::fail(&state.pool, release.id, &message).await {
                tracing::error!(error = %e, "building->failed transition failed");
            }
            ack_job(queue, &job).await;
        }
        Err(BuildError::Transient(message)) => {
            tracing::warn!(error = %message, attempt = job.attempt, "transient build failure, backing off");
            nack_job(queue, &job, retry_backoff(job.attempt)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Queue outcome handling
// ---------------------------------------------------------------------------

/// Ack a finished job. A late ack means the lease expired and another worker
/// owns the job now; the guarded transitions already stopped us from
/// double-advancing state, so only the hand-off is worth noting.
async fn ack_job(queue: &WorkQueue, job: &BuildJob) {
    match queue.ack(job).await {
        Ok(AckOutcome::Acked) => {}
        Ok(AckOutcome::RejectedLate) => {
            tracing::warn!(
                release_id = %job.release_id,
                attempt = job.attempt,
                "late ack rejected; another worker took the job over"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, release_id = %job.release_id, "ack failed");
        }
    }
}

/// Nack for a delayed retry. On failure the lease simply expires and the
/// sweeper requeues the job, so a warning is all that is needed.
async fn nack_job(queue: &WorkQueue, job: &BuildJob, retry_after: Duration) {
    if let Err(e) = queue.nack(job, retry_after).await {
        tracing::warn!(error = %e, release_id = %job.release_id, "nack failed");
    }
}

/// Defer behind the single-flight lock; same fallback as `nack_job`.
async fn defer_job(queue: &WorkQueue, job: &BuildJob, retry_after: Duration) {
    if let Err(e) = queue.defer(job, retry_after).await {
        tracing::warn!(error = %e, release_id = %job.release_id, "defer failed");
    }
}

/// The build itself: source checkout, builder pod, artifacts, ready
/// transition, auto-deploy handoff.
async fn execute(
    state: &AppState,
    release: &releases::Release,
    logbuf: &Arc<LogBuffer>,
) -> Result<(), BuildError> {
    let service = match services::get(&state.pool, release.service_id).await {
        Ok(service) => service,
        Err(StoreError::NotFound(_)) => {
            return Err(BuildError::Deterministic("service no longer exists".into()));
        }
        Err(e) => return Err(BuildError::Transient(e.to_string())),
    };
    let project = match projects::get(&state.pool, service.project_id).await {
        Ok(project) => project,
        Err(StoreError::NotFound(_)) => {
            return Err(BuildError::Deterministic("project no longer exists".into()));
        }
        Err(e) => return Err(BuildError::Transient(e.to_string())),
    };

    let image_uri = format!(
        "{}/{}/{}:v{}",
        state.config.registry_url, project.slug, service.name, release.version
    );

    logbuf.push(LogFrame::info(format!(
        "building {} at {}",
        image_uri, release.git_sha
    )));

    // Materialize the source first: it validates the commit exists and warms
    // the forge-side cache before a builder pod is spent on it.
    let scratch = tempfile::tempdir()
        .map_err(|e| BuildError::Transient(format!("scratch dir failed: {e}")))?;
    workspace::materialize(&project.git_repo, &release.git_sha, scratch.path())
        .await
        .map_err(|e| match e {
            SourceError::Deterministic(msg) => BuildError::Deterministic(msg),
            SourceError::Transient(msg) => BuildError::Transient(msg),
        })?;

    let output = builder::run(
        &state.kube,
        logbuf,
        &BuildRequest {
            release_id: release.id,
            service: &service,
            repo_url: &project.git_repo,
            git_sha: &release.git_sha,
            image_uri: &image_uri,
            namespace: &state.config.build_namespace,
            builder_image: &state.config.builder_image,
        },
    )
    .await?;

    let image_digest = artifacts::extract_image_digest(&output.log_text, &image_uri);
    let recorded = artifacts::record(
        &state.artifacts,
        &state.config.artifact_bucket,
        &state.config.signing_key,
        &service,
        release,
        &image_uri,
        &image_digest,
    )
    .await
    .map_err(|e| BuildError::Transient(format!("artifact store write failed: {e}")))?;

    match releases::complete(
        &state.pool,
        release.id,
        &image_uri,
        &recorded.sbom_uri,
        &recorded.signature_uri,
    )
    .await
    {
        Ok(_) => {}
        Err(StoreError::Conflict(msg)) => {
            // Another attempt already finished; our artifacts are equivalent.
            tracing::warn!(release_id = %release.id, %msg, "ready transition lost race");
            return Ok(());
        }
        Err(e) => return Err(BuildError::Transient(e.to_string())),
    }

    logbuf.push(LogFrame::info(format!("release v{} ready", release.version)));
    auto_deploy(state, release, &service).await;
    Ok(())
}

/// On ready, create a Deployment row for the service's auto-deploy
/// environment. Pull-request builds and non-policy branches produce artifacts
/// only.
async fn auto_deploy(state: &AppState, release: &releases::Release, service: &services::Service) {
    let Some(env_name) = service.auto_deploy_env.as_deref() else {
        return;
    };

    let project_default = match projects::get(&state.pool, service.project_id).await {
        Ok(p) => p.default_branch,
        Err(e) => {
            tracing::error!(error = %e, "project lookup for auto-deploy failed");
            return;
        }
    };
    if !service.matches_branch(&release.branch, &project_default) {
        return;
    }

    let environment =
        match environments::get_by_name(&state.pool, service.project_id, env_name).await {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(error = %e, env_name, "auto-deploy environment missing");
                return;
            }
        };

    // The record lands before the mutation: if the audit buffer refuses it
    // (fail-closed on a compliance-tagged action), the deployment is not
    // created as though the record existed. The release stays ready and can
    // be promoted explicitly once the buffer drains.
    let recorded = state.audit.record(AuditEvent {
        actor: "build-dispatcher".into(),
        action: "deployment.create".into(),
        resource: "deployment".into(),
        resource_id: None,
        outcome: "ok".into(),
        metadata: Some(serde_json::json!({
            "release_id": release.id,
            "environment": env_name,
        })),
    });
    if let Err(e) = recorded {
        tracing::error!(error = %e, release_id = %release.id, "audit refused, skipping auto-deploy");
        return;
    }

    match deployments::create_superseding(
        &state.pool,
        release.id,
        service.id,
        environment.id,
        service.replicas_for(env_name),
    )
    .await
    {
        Ok(deployment) => {
            tracing::info!(
                deployment_id = %deployment.id,
                release_id = %release.id,
                env = env_name,
                "auto-deploy created"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, release_id = %release.id, "auto-deploy creation failed");
        }
    }
}

/// Retry budget exhausted: record the audit event, then move the job to the
/// dead-letter list and fail the release. A refused record nacks the job so
/// the dead-lettering is retried instead of silently losing the event.
async fn dead_letter(state: &AppState, queue: &WorkQueue, job: &BuildJob) {
    tracing::error!(release_id = %job.release_id, attempts = job.attempt, "build retry budget exhausted");

    let recorded = state.audit.record(AuditEvent {
        actor: "build-dispatcher".into(),
        action: "build_job.dead_letter".into(),
        resource: "release".into(),
        resource_id: Some(job.release_id),
        outcome: "dead_letter".into(),
        metadata: Some(serde_json::json!({ "attempts": job.attempt })),
    });
    if let Err(e) = recorded {
        tracing::warn!(error = %e, release_id = %job.release_id, "audit refused, retrying dead-letter");
        nack_job(queue, job, retry_backoff(job.attempt)).await;
        return;
    }

    if let Err(e) = queue.dead_letter(job, "retry budget exhausted").await {
        tracing::error!(error = %e, "dead-letter failed");
    }

    match releases::fail(&state.pool, job.release_id, "build retry budget exhausted").await {
        Ok(_) | Err(StoreError::Conflict(_)) => {}
        Err(e) => tracing::error!(error = %e, "failed to fail dead-lettered release"),
    }
}

/// Full-jitter exponential backoff: `base · 2^attempt`, capped, scaled by a
/// uniform random factor so synchronized retries spread out.
fn retry_backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(BACKOFF_CAP);
    capped.mul_f64(rand::random::<f64>().max(0.05))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        // Jitter makes exact values random; check the envelope.
        for attempt in 0..20 {
            let d = retry_backoff(attempt);
            assert!(d <= BACKOFF_CAP);
            assert!(d >= Duration::from_millis(1));
        }
    }

    #[test]
    fn backoff_envelope_doubles() {
        let envelope = |attempt: u32| {
            BACKOFF_BASE
                .saturating_mul(2u32.saturating_pow(attempt.min(16)))
                .min(BACKOFF_CAP)
        };
        assert_eq!(envelope(0), Duration::from_secs(5));
        assert_eq!(envelope(1), Duration::from_secs(10));
        assert_eq!(envelope(4), Duration::from_secs(80));
        assert_eq!(envelope(12), BACKOFF_CAP);
    }
}
