use std::collections::BTreeMap;

use k8s_openapi::api::core::v1 as core;
use k8s_openapi::api::networking::v1 as networking;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use uuid::Uuid;

use crate::store::deployments::{self, Deployment};
use crate::store::environments::Environment;
use crate::store::releases;
use crate::store::services::Service;
use crate::store::{AppState, StoreError, environments, projects, services};

use super::Reconciler;
use super::deployment::FIELD_MANAGER;

/// Routes traffic to running releases: one core/v1 Service plus one Ingress
/// per (service, environment) with a running deployment. The diff is computed
/// per service so deleted environments and stopped services lose their routes
/// instead of dangling.
pub struct IngressReconciler;

impl Reconciler for IngressReconciler {
    const KIND: &'static str = "ingress";

    async fn list_due(&self, state: &AppState) -> anyhow::Result<Vec<Uuid>> {
        Ok(deployments::service_ids_with_deployments(&state.pool).await?)
    }

    async fn reconcile_one(&self, state: &AppState, key: Uuid) -> anyhow::Result<()> {
        let service = match services::get(&state.pool, key).await {
            Ok(s) => Some(s),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let running = deployments::running_for_service(&state.pool, key).await?;

        // Desired: routes for every environment with a running deployment of
        // an active service.
        let mut desired_names = Vec::new();
        if let Some(service) = &service {
            let project = projects::get(&state.pool, service.project_id).await?;
            for deployment in &running {
                let environment =
                    environments::get(&state.pool, deployment.environment_id).await?;
                let release = releases::get(&state.pool, deployment.release_id).await?;
                let name = route_name(service, &environment);
                let host = environment.hostname_for(&project.slug, &service.name);

                apply_route(
                    state,
                    &environment.namespace,
                    &name,
                    &host,
                    service,
                    &environment,
                    release.version,
                    deployment,
                )
                .await?;
                desired_names.push((environment.namespace.clone(), name));
            }
        }

        prune_orphans(state, key, &desired_names).await?;
        Ok(())
    }
}

pub fn route_name(service: &Service, environment: &Environment) -> String {
    format!("{}-{}", service.name, environment.name)
}

#[allow(clippy::too_many_arguments)]
async fn apply_route(
    state: &AppState,
    namespace: &str,
    name: &str,
    host: &str,
    service: &Service,
    environment: &Environment,
    release_version: i64,
    deployment: &Deployment,
) -> anyhow::Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let svc_obj = build_service_object(name, namespace, service, release_version);
    let svc_api: Api<core::Service> = Api::namespaced(state.kube.clone(), namespace);
    svc_api
        .patch(name, &params, &Patch::Apply(&svc_obj))
        .await?;

    let ing_obj = build_ingress_object(name, namespace, host, service, environment);
    let ing_api: Api<networking::Ingress> = Api::namespaced(state.kube.clone(), namespace);
    ing_api
        .patch(name, &params, &Patch::Apply(&ing_obj))
        .await?;

    tracing::debug!(%name, %host, deployment_id = %deployment.id, "route applied");
    Ok(())
}

/// Delete owned routes whose (service, environment) no longer has a running
/// deployment.
async fn prune_orphans(
    state: &AppState,
    service_id: Uuid,
    desired: &[(String, String)],
) -> anyhow::Result<()> {
    let selector = format!("enclii.dev/service={service_id}");
    let lp = ListParams::default().labels(&selector);

    let ing_api: Api<networking::Ingress> = Api::all(state.kube.clone());
    for ingress in ing_api.list(&lp).await? {
        let ns = ingress.metadata.namespace.clone().unwrap_or_default();
        let name = ingress.metadata.name.clone().unwrap_or_default();
        if desired.iter().any(|(dns, dn)| *dns == ns && *dn == name) {
            continue;
        }

        let scoped: Api<networking::Ingress> = Api::namespaced(state.kube.clone(), &ns);
        match scoped.delete(&name, &DeleteParams::default()).await {
            Ok(_) => tracing::info!(%ns, %name, "orphaned ingress removed"),
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let svc_scoped: Api<core::Service> = Api::namespaced(state.kube.clone(), &ns);
        match svc_scoped.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn route_labels(service: &Service, environment: &Environment) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("enclii.dev/service".to_owned(), service.id.to_string()),
        ("enclii.dev/environment".to_owned(), environment.name.clone()),
        ("enclii.dev/managed-by".to_owned(), "enclii".to_owned()),
    ])
}

pub fn build_service_object(
    name: &str,
    namespace: &str,
    service: &Service,
    release_version: i64,
) -> core::Service {
    core::Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(BTreeMap::from([(
                "enclii.dev/service".to_owned(),
                service.id.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(core::ServiceSpec {
            selector: Some(BTreeMap::from([
                ("app".to_owned(), service.name.clone()),
                (
                    "enclii.dev/release".to_owned(),
                    format!("v{release_version}"),
                ),
            ])),
            ports: Some(vec![core::ServicePort {
                port: 80,
                target_port: Some(IntOrString::Int(service.port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_ingress_object(
    name: &str,
    namespace: &str,
    host: &str,
    service: &Service,
    environment: &Environment,
) -> networking::Ingress {
    networking::Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(route_labels(service, environment)),
            ..Default::default()
        },
        spec: Some(networking::IngressSpec {
            rules: Some(vec![networking::IngressRule {
                host: Some(host.to_owned()),
                http: Some(networking::HTTPIngressRuleValue {
                    paths: vec![networking::HTTPIngressPath {
                        path: Some("/".into()),
                        path_type: "Prefix".into(),
                        backend: networking::IngressBackend {
                            service: Some(networking::IngressServiceBackend {
                                name: name.to_owned(),
                                port: Some(networking::ServiceBackendPort {
                                    number: Some(80),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn service() -> Service {
        Service {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "api".into(),
            dockerfile: None,
            buildpack: None,
            port: 3000,
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

    fn environment() -> Environment {
        Environment {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "staging".into(),
            namespace: "acme-staging".into(),
            hostname_template: "{service}.{env}.{project}.enclii.dev".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn route_name_per_service_env() {
        assert_eq!(route_name(&service(), &environment()), "api-staging");
    }

    #[test]
    fn service_object_selects_release() {
        let obj = build_service_object("api-staging", "acme-staging", &service(), 4);
        let selector = obj.spec.as_ref().unwrap().selector.as_ref().unwrap();
        assert_eq!(selector["app"], "api");
        assert_eq!(selector["enclii.dev/release"], "v4");

        let port = &obj.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(3000)));
    }

    #[test]
    fn ingress_object_routes_host_to_service() {
        let svc = service();
        let env = environment();
        let obj = build_ingress_object(
            "api-staging",
            "acme-staging",
            "api.staging.acme.enclii.dev",
            &svc,
            &env,
        );

        let rule = &obj.spec.as_ref().unwrap().rules.as_ref().unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("api.staging.acme.enclii.dev"));

        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path_type, "Prefix");
        assert_eq!(
            path.backend.service.as_ref().unwrap().name,
            "api-staging"
        );
    }

    #[test]
    fn ingress_carries_owner_labels() {
        let svc = service();
        let env = environment();
        let obj = build_ingress_object("api-staging", "acme-staging", "h", &svc, &env);
        let labels = obj.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["enclii.dev/service"], svc.id.to_string());
        assert_eq!(labels["enclii.dev/managed-by"], "enclii");
    }
}
