use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::Api;
use kube::api::{DeleteParams, LogParams, PostParams};
use uuid::Uuid;

use super::logbuf::{LogBuffer, LogFrame};
use crate::store::services::Service;

/// Cap on accumulated log text kept in memory for persistence.
const MAX_LOG_BYTES: usize = 4 * 1024 * 1024;

/// Overall wall-clock bound on one builder pod.
const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Non-zero builder exit or timeout; retrying will not change the result.
    #[error("build failed: {0}")]
    Deterministic(String),

    /// Infrastructure trouble (API server, registry 5xx); retry with backoff.
    #[error("build infrastructure unavailable: {0}")]
    Transient(String),
}

pub struct BuildRequest<'a> {
    pub release_id: Uuid,
    pub service: &'a Service,
    pub repo_url: &'a str,
    pub git_sha: &'a str,
    pub image_uri: &'a str,
    pub namespace: &'a str,
    pub builder_image: &'a str,
}

pub struct BuildOutput {
    pub log_text: String,
}

/// Run one builder pod to completion, tailing its output into the live log
/// buffer. The pod is deleted on every exit path.
#[tracing::instrument(skip_all, fields(release_id = %req.release_id, image = %req.image_uri), err)]
pub async fn run(
    kube: &kube::Client,
    logbuf: &Arc<LogBuffer>,
    req: &BuildRequest<'_>,
) -> Result<BuildOutput, BuildError> {
    let pods: Api<Pod> = Api::namespaced(kube.clone(), req.namespace);
    let pod_name = pod_name(req.release_id);
    let spec = build_pod_spec(req, &pod_name);

    pods.create(&PostParams::default(), &spec)
        .await
        .map_err(|e| BuildError::Transient(format!("builder pod create failed: {e}")))?;

    logbuf.push(LogFrame::info(format!(
        "builder pod {pod_name} created for {}",
        req.image_uri
    )));

    let result = drive_pod(&pods, &pod_name, logbuf).await;

    // Clean up regardless of outcome; a missing pod is fine.
    let _ = pods.delete(&pod_name, &DeleteParams::default()).await;

    result
}

fn pod_name(release_id: Uuid) -> String {
    format!("builder-{}", &release_id.to_string()[..8])
}

async fn drive_pod(
    pods: &Api<Pod>,
    pod_name: &str,
    logbuf: &Arc<LogBuffer>,
) -> Result<BuildOutput, BuildError> {
    let deadline = tokio::time::Instant::now() + BUILD_TIMEOUT;
    let mut log_text = String::new();
    let mut tailing = false;

    loop {
        if tokio::time::Instant::now() > deadline {
            logbuf.push(LogFrame::error("build timed out"));
            return Err(BuildError::Deterministic("build timed out".into()));
        }

        tokio::time::sleep(Duration::from_secs(3)).await;

        let pod = match pods.get(pod_name).await {
            Ok(p) => p,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return Err(BuildError::Transient(format!("pod {pod_name} disappeared")));
            }
            Err(e) => return Err(BuildError::Transient(e.to_string())),
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");

        // Start the log tail once the container is past Pending. The tail
        // returns when the stream closes (pod terminated) or the deadline
        // fires, then the phase poll below sees the terminal state.
        if !tailing && phase != "Pending" {
            tailing = true;
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let _ = tokio::time::timeout(remaining, tail_logs(pods, pod_name, logbuf, &mut log_text))
                .await;
        }

        match phase {
            "Succeeded" => {
                return Ok(BuildOutput { log_text });
            }
            "Failed" => {
                let exit_code = pod
                    .status
                    .as_ref()
                    .and_then(extract_exit_code)
                    .unwrap_or(1);
                logbuf.push(LogFrame::error(format!(
                    "builder exited with code {exit_code}"
                )));
                return Err(BuildError::Deterministic(format!(
                    "builder exited with code {exit_code}"
                )));
            }
            "Pending" | "Running" => {}
            other => {
                tracing::warn!(pod = pod_name, phase = other, "unexpected pod phase");
            }
        }
    }
}

/// Follow the pod's log stream until it closes, mirroring each line into the
/// ring buffer and the accumulated text.
async fn tail_logs(
    pods: &Api<Pod>,
    pod_name: &str,
    logbuf: &Arc<LogBuffer>,
    log_text: &mut String,
) {
    let params = LogParams {
        container: Some("builder".into()),
        follow: true,
        ..Default::default()
    };

    let stream = match pods.log_stream(pod_name, &params).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, pod = pod_name, "failed to open log stream");
            return;
        }
    };

    let mut lines = stream.lines();
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if log_text.len() + line.len() < MAX_LOG_BYTES {
                    log_text.push_str(&line);
                    log_text.push('\n');
                }
                logbuf.push(LogFrame::log(pod_name, line));
            }
            Err(e) => {
                tracing::warn!(error = %e, pod = pod_name, "log stream error");
                break;
            }
        }
    }
}

fn extract_exit_code(status: &k8s_openapi::api::core::v1::PodStatus) -> Option<i32> {
    status
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

// ---------------------------------------------------------------------------
// Pod spec
// ---------------------------------------------------------------------------

fn build_pod_spec(req: &BuildRequest<'_>, pod_name: &str) -> Pod {
    let labels = BTreeMap::from([
        ("enclii.dev/release".into(), req.release_id.to_string()),
        ("enclii.dev/service".into(), req.service.id.to_string()),
        ("enclii.dev/role".into(), "builder".into()),
    ]);

    Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(pod_name.into()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".into()),
            containers: vec![Container {
                name: "builder".into(),
                image: Some(req.builder_image.into()),
                args: Some(builder_args(req)),
                resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                    limits: Some(BTreeMap::from([
                        ("cpu".into(), Quantity("2".into())),
                        ("memory".into(), Quantity("4Gi".into())),
                    ])),
                    requests: Some(BTreeMap::from([
                        ("cpu".into(), Quantity("500m".into())),
                        ("memory".into(), Quantity("1Gi".into())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builder CLI contract: git context pinned to the exact commit, destination
/// image, and either a Dockerfile path or a buildpack hint from the service's
/// build config.
fn builder_args(req: &BuildRequest<'_>) -> Vec<String> {
    let mut args = vec![
        format!("--context=git://{}#{}", strip_scheme(req.repo_url), req.git_sha),
        format!("--destination={}", req.image_uri),
    ];

    match (&req.service.dockerfile, &req.service.buildpack) {
        (Some(dockerfile), _) => args.push(format!("--dockerfile={dockerfile}")),
        (None, Some(buildpack)) => args.push(format!("--buildpack={buildpack}")),
        (None, None) => args.push("--dockerfile=Dockerfile".into()),
    }

    args
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn service(dockerfile: Option<&str>, buildpack: Option<&str>) -> Service {
        Service {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "api".into(),
            dockerfile: dockerfile.map(Into::into),
            buildpack: buildpack.map(Into::into),
            port: 8080,
            env_vars: serde_json::json!({}),
            cpu_request: "250m".into(),
            cpu_limit: "1".into(),
            memory_request: "256Mi".into(),
            memory_limit: "1Gi".into(),
            replicas: serde_json::json!({}),
            build_branch: None,
            auto_deploy_env: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn request(service: &Service) -> BuildRequest<'_> {
        BuildRequest {
            release_id: Uuid::new_v4(),
            service,
            repo_url: "https://github.com/acme/api",
            git_sha: "deadbeef",
            image_uri: "registry.enclii.dev/api:v3",
            namespace: "enclii-builds",
            builder_image: "builder:latest",
        }
    }

    #[test]
    fn args_pin_context_to_commit() {
        let svc = service(None, None);
        let args = builder_args(&request(&svc));
        assert_eq!(args[0], "--context=git://github.com/acme/api#deadbeef");
        assert_eq!(args[1], "--destination=registry.enclii.dev/api:v3");
        assert_eq!(args[2], "--dockerfile=Dockerfile");
    }

    #[test]
    fn dockerfile_hint_wins_over_buildpack() {
        let svc = service(Some("build/Dockerfile.prod"), Some("paketo/node"));
        let args = builder_args(&request(&svc));
        assert!(args.contains(&"--dockerfile=build/Dockerfile.prod".to_owned()));
    }

    #[test]
    fn buildpack_hint_used_without_dockerfile() {
        let svc = service(None, Some("paketo/node"));
        let args = builder_args(&request(&svc));
        assert!(args.contains(&"--buildpack=paketo/node".to_owned()));
    }

    #[test]
    fn pod_spec_shape() {
        let svc = service(None, None);
        let req = request(&svc);
        let pod = build_pod_spec(&req, "builder-abc");

        assert_eq!(pod.metadata.name.as_deref(), Some("builder-abc"));
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers[0].name, "builder");
        assert_eq!(spec.containers[0].image.as_deref(), Some("builder:latest"));
    }

    #[test]
    fn pod_name_is_bounded() {
        let name = pod_name(Uuid::new_v4());
        assert!(name.starts_with("builder-"));
        assert_eq!(name.len(), "builder-".len() + 8);
    }
}
