use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1 as apps;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Probe, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::api::{DeleteParams, Patch, PatchParams};
use uuid::Uuid;

use crate::store::deployments::{self, Deployment, health, status};
use crate::store::environments::Environment;
use crate::store::releases::{self, Release};
use crate::store::services::{BoundAddon, Service};
use crate::store::{AppState, StoreError, environments, projects, services};

use super::{Reconciler, ensure_namespace};

pub const FIELD_MANAGER: &str = "enclii-reconciler";

/// Highest-complexity loop: desired Deployment rows plus release artifacts in,
/// cluster apps/v1 Deployments out, observed state written back.
pub struct DeploymentReconciler;

impl Reconciler for DeploymentReconciler {
    const KIND: &'static str = "deployment";

    async fn list_due(&self, state: &AppState) -> anyhow::Result<Vec<Uuid>> {
        let rows = deployments::list_reconcilable(&state.pool).await?;
        Ok(rows.into_iter().map(|d| d.id).collect())
    }

    async fn reconcile_one(&self, state: &AppState, key: Uuid) -> anyhow::Result<()> {
        let deployment = match deployments::get(&state.pool, key).await {
            Ok(d) => d,
            // Row vanished between list and step; nothing to converge.
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match deployment.status.as_str() {
            status::STOPPED => cleanup_superseded(state, &deployment).await,
            status::PENDING => {
                let deployment = match deployments::start_deploy(&state.pool, deployment.id).await {
                    Ok(d) => d,
                    // Another trigger claimed it; that step converges.
                    Err(StoreError::Conflict(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                converge(state, &deployment).await
            }
            status::DEPLOYING | status::RUNNING => converge(state, &deployment).await,
            _ => Ok(()),
        }
    }
}

/// Apply the desired cluster state and fold the observation back into the row.
async fn converge(state: &AppState, deployment: &Deployment) -> anyhow::Result<()> {
    let release = releases::get(&state.pool, deployment.release_id).await?;
    let Some(image_uri) = release.image_uri.clone() else {
        // A deployment can only point at a ready release; a missing image is
        // data corruption, not something retry fixes.
        deployments::mark_failed(
            &state.pool,
            deployment.id,
            "release has no image artifact",
            false,
        )
        .await?;
        return Ok(());
    };

    let service = services::get(&state.pool, deployment.service_id).await?;
    let project = projects::get(&state.pool, service.project_id).await?;
    let environment = environments::get(&state.pool, deployment.environment_id).await?;

    ensure_namespace(&state.kube, &environment.namespace).await?;

    let bound = services::bound_addons(&state.pool, service.id).await?;
    let name = object_name(&service, &environment, &release);
    let desired = build_deployment_object(&name, &service, &environment, &release, deployment, &image_uri, &bound);

    let api: Api<apps::Deployment> = Api::namespaced(state.kube.clone(), &environment.namespace);
    let params = PatchParams::apply(FIELD_MANAGER).force();

    match api.patch(&name, &params, &Patch::Apply(&desired)).await {
        Ok(_) => {}
        Err(kube::Error::Api(err)) if is_quota_rejection(&err) => {
            // No retry until a human acknowledges the row.
            deployments::mark_failed(&state.pool, deployment.id, &err.message, true).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    observe(state, deployment, &api, &name).await
}

/// Read the cluster object and write `ready_replicas`/`health` back; promote
/// `deploying → running` when the rollout is complete.
async fn observe(
    state: &AppState,
    deployment: &Deployment,
    api: &Api<apps::Deployment>,
    name: &str,
) -> anyhow::Result<()> {
    let observed = match api.get(name).await {
        Ok(obj) => obj,
        // Applied but not yet visible; the next tick observes it.
        Err(kube::Error::Api(err)) if err.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let observation = interpret_status(observed.status.as_ref(), deployment.replicas);

    deployments::observe(
        &state.pool,
        deployment.id,
        observation.ready_replicas,
        observation.health,
    )
    .await?;

    if observation.progress_dead {
        deployments::mark_failed(
            &state.pool,
            deployment.id,
            "rollout exceeded its progress deadline (image pull or crash loop)",
            false,
        )
        .await?;
        return Ok(());
    }

    if deployment.status == status::DEPLOYING && observation.rollout_complete {
        match deployments::mark_running(&state.pool, deployment.id).await {
            Ok(d) => {
                tracing::info!(deployment_id = %d.id, "deployment running");
            }
            // Lost a race with another trigger; fine either way.
            Err(StoreError::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Remove the superseded cluster object once the replacement has been stable
/// for the grace window, keeping the row for rollback history.
async fn cleanup_superseded(state: &AppState, deployment: &Deployment) -> anyhow::Result<()> {
    if deployment.cleaned_up {
        return Ok(());
    }

    let grace = chrono::Duration::seconds(state.config.supersede_grace_secs as i64);
    if let Some(superseded_at) = deployment.superseded_at
        && Utc::now() < superseded_at + grace
    {
        // Inside the grace window; the next tick retries.
        return Ok(());
    }

    // Re-promoting the same release reuses the object name; never delete an
    // object a live rollout still owns.
    let live = deployments::live_rows_for_release(
        &state.pool,
        deployment.service_id,
        deployment.environment_id,
        deployment.release_id,
    )
    .await?;
    if live > 0 {
        deployments::mark_cleaned_up(&state.pool, deployment.id).await?;
        return Ok(());
    }

    let release = releases::get(&state.pool, deployment.release_id).await?;
    let service = services::get(&state.pool, deployment.service_id).await?;
    let environment = environments::get(&state.pool, deployment.environment_id).await?;
    let name = object_name(&service, &environment, &release);

    let api: Api<apps::Deployment> = Api::namespaced(state.kube.clone(), &environment.namespace);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(err)) if err.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    deployments::mark_cleaned_up(&state.pool, deployment.id).await?;
    tracing::info!(deployment_id = %deployment.id, object = name, "superseded object removed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Desired-state construction
// ---------------------------------------------------------------------------

/// Cluster object name, unique per release so a rollout and its predecessor
/// coexist until the supersede grace elapses.
pub fn object_name(service: &Service, environment: &Environment, release: &Release) -> String {
    format!("{}-{}-v{}", service.name, environment.name, release.version)
}

pub fn build_deployment_object(
    name: &str,
    service: &Service,
    environment: &Environment,
    release: &Release,
    deployment: &Deployment,
    image_uri: &str,
    bound: &[BoundAddon],
) -> apps::Deployment {
    let labels = BTreeMap::from([
        ("app".to_owned(), service.name.clone()),
        ("enclii.dev/service".to_owned(), service.id.to_string()),
        ("enclii.dev/environment".to_owned(), environment.name.clone()),
        ("enclii.dev/release".to_owned(), format!("v{}", release.version)),
        ("enclii.dev/managed-by".to_owned(), "enclii".to_owned()),
    ]);
    let selector = BTreeMap::from([
        ("app".to_owned(), service.name.clone()),
        ("enclii.dev/release".to_owned(), format!("v{}", release.version)),
    ]);

    apps::Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(environment.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(apps::DeploymentSpec {
            replicas: Some(deployment.replicas),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: k8s_openapi::api::core::v1::PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(k8s_openapi::api::core::v1::PodSpec {
                    containers: vec![Container {
                        name: service.name.clone(),
                        image: Some(image_uri.to_owned()),
                        ports: Some(vec![ContainerPort {
                            container_port: service.port,
                            ..Default::default()
                        }]),
                        env: Some(build_env(service, bound)),
                        resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                            requests: Some(BTreeMap::from([
                                ("cpu".into(), Quantity(service.cpu_request.clone())),
                                ("memory".into(), Quantity(service.memory_request.clone())),
                            ])),
                            limits: Some(BTreeMap::from([
                                ("cpu".into(), Quantity(service.cpu_limit.clone())),
                                ("memory".into(), Quantity(service.memory_limit.clone())),
                            ])),
                            ..Default::default()
                        }),
                        readiness_probe: Some(Probe {
                            tcp_socket: Some(TCPSocketAction {
                                port: IntOrString::Int(service.port),
                                ..Default::default()
                            }),
                            initial_delay_seconds: Some(3),
                            period_seconds: Some(5),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container env: the service's declared variables plus one connection URL
/// per bound ready addon. Deterministic order keeps server-side apply
/// idempotent.
pub fn build_env(service: &Service, bound: &[BoundAddon]) -> Vec<EnvVar> {
    let mut vars: BTreeMap<String, String> = BTreeMap::new();

    if let Some(map) = service.env_vars.as_object() {
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                vars.insert(key.clone(), value.to_owned());
            }
        }
    }

    for addon in bound {
        let Some(url) = addon
            .connection
            .as_ref()
            .and_then(|c| c.get("url"))
            .and_then(serde_json::Value::as_str)
        else {
            continue;
        };
        let key = format!("{}{}", addon.env_prefix, addon_env_key(&addon.addon_type));
        vars.insert(key, url.to_owned());
    }

    vars.into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect()
}

pub fn addon_env_key(addon_type: &str) -> &'static str {
    match addon_type {
        "postgres" => "DATABASE_URL",
        "redis" => "REDIS_URL",
        "mysql" => "MYSQL_URL",
        _ => "ADDON_URL",
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub struct Observation {
    pub ready_replicas: i32,
    pub health: &'static str,
    pub rollout_complete: bool,
    pub progress_dead: bool,
}

pub fn interpret_status(
    observed: Option<&apps::DeploymentStatus>,
    desired_replicas: i32,
) -> Observation {
    let Some(observed) = observed else {
        return Observation {
            ready_replicas: 0,
            health: health::UNKNOWN,
            rollout_complete: false,
            progress_dead: false,
        };
    };

    let ready = observed.ready_replicas.unwrap_or(0);
    let condition = |kind: &str| {
        observed
            .conditions
            .as_ref()
            .and_then(|c| c.iter().find(|c| c.type_ == kind))
    };

    let available = condition("Available").is_some_and(|c| c.status == "True");
    let progress_dead = condition("Progressing")
        .is_some_and(|c| c.status == "False" && c.reason.as_deref() == Some("ProgressDeadlineExceeded"));

    let health = if progress_dead {
        health::UNHEALTHY
    } else if available {
        health::HEALTHY
    } else {
        health::UNKNOWN
    };

    Observation {
        ready_replicas: ready,
        health,
        rollout_complete: available && ready >= desired_replicas,
        progress_dead,
    }
}

fn is_quota_rejection(err: &kube::core::ErrorResponse) -> bool {
    err.code == 403 && err.message.to_lowercase().contains("quota")
}
