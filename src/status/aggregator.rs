use uuid::Uuid;

use crate::store::{AppState, StoreError, deployments, projects, releases, services, valkey};

use super::forge_ci::ForgeCiClient;
use super::{BuildStage, DeployStage, UnifiedBuildStatus, overall_status};

/// Short TTL smooths client polling storms without hiding real transitions.
const CACHE_TTL_SECS: i64 = 5;

fn cache_key(service_id: Uuid, git_sha: &str) -> String {
    format!("status:{service_id}:{git_sha}")
}

/// Synthesize the unified view for `(service, commit)`. Read-only: every
/// stage comes from rows or the forge, never from mutation.
pub async fn unified_status(
    state: &AppState,
    service_id: Uuid,
    git_sha: &str,
) -> Result<UnifiedBuildStatus, StoreError> {
    let key = cache_key(service_id, git_sha);
    if let Some(cached) = valkey::get_cached::<UnifiedBuildStatus>(&state.valkey, &key).await {
        return Ok(cached);
    }

    let service = services::get(&state.pool, service_id).await?;
    let project = projects::get(&state.pool, service.project_id).await?;

    let release = releases::get_by_sha(&state.pool, service_id, git_sha).await?;

    let build = release.as_ref().map(|r| BuildStage {
        release_id: r.id,
        version: r.version,
        status: r.status.clone(),
        error_message: r.error_message.clone(),
    });

    let deploy = match &release {
        Some(r) => deployments::latest_for_release(&state.pool, r.id)
            .await?
            .map(|d| DeployStage {
                deployment_id: d.id,
                environment_id: d.environment_id,
                status: d.status,
                health: d.health,
                ready_replicas: d.ready_replicas,
                replicas: d.replicas,
            }),
        None => None,
    };

    let ci = ForgeCiClient::from_config(&state.config)
        .fetch(&project.git_repo, git_sha)
        .await;

    let overall = overall_status(
        ci.as_ref().map(|s| s.status.as_str()),
        build.as_ref().map(|b| b.status.as_str()),
        deploy.as_ref().map(|d| d.status.as_str()),
    );

    let status = UnifiedBuildStatus {
        service_id,
        git_sha: git_sha.to_owned(),
        ci,
        build,
        deploy,
        overall_status: overall,
    };

    if let Err(e) = valkey::set_cached(&state.valkey, &key, &status, CACHE_TTL_SECS).await {
        tracing::debug!(error = %e, "status cache write failed");
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_scoped_per_commit() {
        let id = Uuid::new_v4();
        assert_ne!(cache_key(id, "abc"), cache_key(id, "def"));
        assert_ne!(cache_key(id, "abc"), cache_key(Uuid::new_v4(), "abc"));
    }
}
