use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use k8s_openapi::api::apps::v1 as apps;
use k8s_openapi::api::core::v1 as core;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Api;
use kube::api::{DeleteParams, Patch, PatchParams};
use sha2::Sha256;
use uuid::Uuid;

use crate::store::addons::{self, Addon, status};
use crate::store::{AppState, StoreError, projects};

use super::Reconciler;
use super::deployment::FIELD_MANAGER;

/// Provisions managed addons (postgres, redis, mysql) as in-cluster
/// StatefulSets and surfaces connection info on the row. Deletion removes the
/// backing resources only once nothing references the addon.
pub struct AddonReconciler;

impl Reconciler for AddonReconciler {
    const KIND: &'static str = "addon";

    async fn list_due(&self, state: &AppState) -> anyhow::Result<Vec<Uuid>> {
        let rows = addons::list_reconcilable(&state.pool).await?;
        Ok(rows.into_iter().map(|a| a.id).collect())
    }

    async fn reconcile_one(&self, state: &AppState, key: Uuid) -> anyhow::Result<()> {
        let addon = match addons::get(&state.pool, key).await {
            Ok(a) => a,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match addon.status.as_str() {
            status::PENDING => {
                let addon = match addons::start_provisioning(&state.pool, addon.id).await {
                    Ok(a) => a,
                    Err(StoreError::Conflict(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                provision(state, &addon).await
            }
            status::PROVISIONING => provision(state, &addon).await,
            status::DELETING => teardown(state, &addon).await,
            _ => Ok(()),
        }
    }
}

/// Apply the backing StatefulSet + Service, then observe readiness; the ready
/// transition atomically records connection fields (which the deployment
/// reconciler injects into bound services).
async fn provision(state: &AppState, addon: &Addon) -> anyhow::Result<()> {
    let Some(spec) = AddonTypeSpec::for_type(&addon.addon_type) else {
        addons::mark_failed(&state.pool, addon.id, "unknown addon type").await?;
        return Ok(());
    };

    let project = projects::get(&state.pool, addon.project_id).await?;
    let namespace = addon_namespace(&project.slug);
    let name = object_name(addon);
    let password = derive_password(&state.config.signing_key, addon.id);

    super::ensure_namespace(&state.kube, &namespace).await?;

    let params = PatchParams::apply(FIELD_MANAGER).force();

    let sts = build_statefulset(&name, &namespace, addon, &spec, &password);
    let sts_api: Api<apps::StatefulSet> = Api::namespaced(state.kube.clone(), &namespace);
    sts_api.patch(&name, &params, &Patch::Apply(&sts)).await?;

    let svc = build_service(&name, &namespace, addon, &spec);
    let svc_api: Api<core::Service> = Api::namespaced(state.kube.clone(), &namespace);
    svc_api.patch(&name, &params, &Patch::Apply(&svc)).await?;

    // Observe: one ready replica means the addon is usable.
    let observed = sts_api.get(&name).await?;
    let ready = observed
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    if ready >= 1 {
        let connection = connection_fields(&name, &namespace, &spec, &password);
        match addons::mark_ready(&state.pool, addon.id, connection).await {
            Ok(_) => {
                tracing::info!(addon_id = %addon.id, "addon ready");
            }
            // Already ready via another trigger, or deletion started; a
            // ready addon never regresses, so leave it be.
            Err(StoreError::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Remove backing resources, then `deleting → deleted`. The bindings check at
/// `start_deleting` plus this re-check keep references from dangling.
async fn teardown(state: &AppState, addon: &Addon) -> anyhow::Result<()> {
    let bindings = binding_count(state, addon.id).await?;
    if bindings > 0 {
        tracing::warn!(addon_id = %addon.id, bindings, "deletion deferred; addon still bound");
        return Ok(());
    }

    let project = projects::get(&state.pool, addon.project_id).await?;
    let namespace = addon_namespace(&project.slug);
    let name = object_name(addon);

    let sts_api: Api<apps::StatefulSet> = Api::namespaced(state.kube.clone(), &namespace);
    match sts_api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(err)) if err.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    let svc_api: Api<core::Service> = Api::namespaced(state.kube.clone(), &namespace);
    match svc_api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(err)) if err.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    match addons::mark_deleted(&state.pool, addon.id).await {
        Ok(_) => tracing::info!(addon_id = %addon.id, "addon deleted"),
        Err(StoreError::Conflict(_)) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn binding_count(state: &AppState, addon_id: Uuid) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM addon_bindings WHERE addon_id = $1")
        .bind(addon_id)
        .fetch_one(&state.pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Addon type catalogue
// ---------------------------------------------------------------------------

pub struct AddonTypeSpec {
    pub image: &'static str,
    pub port: i32,
    pub scheme: &'static str,
    pub username: &'static str,
    pub database: Option<&'static str>,
    pub password_env: Option<&'static str>,
}

impl AddonTypeSpec {
    pub fn for_type(addon_type: &str) -> Option<Self> {
        match addon_type {
            "postgres" => Some(Self {
                image: "postgres:16",
                port: 5432,
                scheme: "postgres",
                username: "enclii",
                database: Some("app"),
                password_env: Some("POSTGRES_PASSWORD"),
            }),
            "redis" => Some(Self {
                image: "redis:7",
                port: 6379,
                scheme: "redis",
                username: "default",
                database: None,
                password_env: None,
            }),
            "mysql" => Some(Self {
                image: "mysql:8",
                port: 3306,
                scheme: "mysql",
                username: "enclii",
                database: Some("app"),
                password_env: Some("MYSQL_ROOT_PASSWORD"),
            }),
            _ => None,
        }
    }
}

pub fn addon_namespace(project_slug: &str) -> String {
    format!("{project_slug}-addons")
}

pub fn object_name(addon: &Addon) -> String {
    format!("addon-{}", addon.name)
}

/// Credentials are derived, not stored: the same addon id and signing key
/// always produce the same password, so provisioning needs no intermediate
/// secret state.
pub fn derive_password(signing_key: &str, addon_id: Uuid) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(signing_key.as_bytes())
        .expect("hmac accepts any key size");
    mac.update(b"addon-credential:");
    mac.update(addon_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())[..24].to_owned()
}

pub fn connection_fields(
    name: &str,
    namespace: &str,
    spec: &AddonTypeSpec,
    password: &str,
) -> serde_json::Value {
    let host = format!("{name}.{namespace}.svc.cluster.local");
    let url = match spec.database {
        Some(db) => format!(
            "{}://{}:{}@{}:{}/{}",
            spec.scheme, spec.username, password, host, spec.port, db
        ),
        None => format!("{}://{}:{}", spec.scheme, host, spec.port),
    };

    serde_json::json!({
        "url": url,
        "host": host,
        "port": spec.port,
        "username": spec.username,
        "database": spec.database,
    })
}

fn addon_labels(addon: &Addon) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("enclii.dev/addon".to_owned(), addon.id.to_string()),
        ("enclii.dev/addon-type".to_owned(), addon.addon_type.clone()),
        ("enclii.dev/managed-by".to_owned(), "enclii".to_owned()),
    ])
}

pub fn build_statefulset(
    name: &str,
    namespace: &str,
    addon: &Addon,
    spec: &AddonTypeSpec,
    password: &str,
) -> apps::StatefulSet {
    let labels = addon_labels(addon);

    let mut env = Vec::new();
    if let Some(password_env) = spec.password_env {
        env.push(core::EnvVar {
            name: password_env.into(),
            value: Some(password.to_owned()),
            ..Default::default()
        });
    }
    if spec.scheme == "postgres" {
        env.push(core::EnvVar {
            name: "POSTGRES_USER".into(),
            value: Some(spec.username.into()),
            ..Default::default()
        });
        env.push(core::EnvVar {
            name: "POSTGRES_DB".into(),
            value: spec.database.map(Into::into),
            ..Default::default()
        });
    }
    if spec.scheme == "mysql" {
        env.push(core::EnvVar {
            name: "MYSQL_DATABASE".into(),
            value: spec.database.map(Into::into),
            ..Default::default()
        });
    }

    apps::StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(apps::StatefulSetSpec {
            service_name: Some(name.to_owned()),
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: core::PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(core::PodSpec {
                    containers: vec![core::Container {
                        name: addon.addon_type.clone(),
                        image: Some(spec.image.into()),
                        ports: Some(vec![core::ContainerPort {
                            container_port: spec.port,
                            ..Default::default()
                        }]),
                        env: Some(env),
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

pub fn build_service(
    name: &str,
    namespace: &str,
    addon: &Addon,
    spec: &AddonTypeSpec,
) -> core::Service {
    core::Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(addon_labels(addon)),
            ..Default::default()
        },
        spec: Some(core::ServiceSpec {
            selector: Some(addon_labels(addon)),
            ports: Some(vec![core::ServicePort {
                port: spec.port,
                ..Default::default()
            }]),
            cluster_ip: None,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn addon(addon_type: &str) -> Addon {
        Addon {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            addon_type: addon_type.into(),
            name: "maindb".into(),
            config: serde_json::json!({}),
            status: "provisioning".into(),
            connection: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn type_catalogue_covers_supported_addons() {
        for t in ["postgres", "redis", "mysql"] {
            assert!(AddonTypeSpec::for_type(t).is_some(), "{t}");
        }
        assert!(AddonTypeSpec::for_type("kafka").is_none());
    }

    #[test]
    fn derived_password_is_stable_and_key_scoped() {
        let id = Uuid::new_v4();
        assert_eq!(derive_password("k", id), derive_password("k", id));
        assert_ne!(derive_password("k", id), derive_password("other", id));
        assert_ne!(derive_password("k", id), derive_password("k", Uuid::new_v4()));
        assert_eq!(derive_password("k", id).len(), 24);
    }

    #[test]
    fn postgres_connection_url() {
        let spec = AddonTypeSpec::for_type("postgres").unwrap();
        let conn = connection_fields("addon-maindb", "acme-addons", &spec, "pw");
        assert_eq!(
            conn["url"],
            "postgres://enclii:pw@addon-maindb.acme-addons.svc.cluster.local:5432/app"
        );
        assert_eq!(conn["port"], 5432);
    }

    #[test]
    fn redis_connection_url_has_no_credentials() {
        let spec = AddonTypeSpec::for_type("redis").unwrap();
        let conn = connection_fields("addon-cache", "acme-addons", &spec, "pw");
        assert_eq!(
            conn["url"],
            "redis://addon-cache.acme-addons.svc.cluster.local:6379"
        );
    }

    #[test]
    fn statefulset_carries_password_env() {
        let a = addon("postgres");
        let spec = AddonTypeSpec::for_type("postgres").unwrap();
        let sts = build_statefulset("addon-maindb", "acme-addons", &a, &spec, "pw");

        let container = &sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("postgres:16"));
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|v| v.name == "POSTGRES_PASSWORD"));
        assert!(env.iter().any(|v| v.name == "POSTGRES_USER"));
    }

    #[test]
    fn service_exposes_addon_port() {
        let a = addon("redis");
        let spec = AddonTypeSpec::for_type("redis").unwrap();
        let svc = build_service("addon-cache", "acme-addons", &a, &spec);
        assert_eq!(svc.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port, 6379);
    }
}
