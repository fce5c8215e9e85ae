use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::api::{Patch, PatchParams};
use uuid::Uuid;

use crate::store::deployments::{self, RunningRoute};
use crate::store::AppState;

use super::Reconciler;
use super::deployment::FIELD_MANAGER;

/// Namespace and object carrying the tunnel daemon's route table.
pub const TUNNEL_NAMESPACE: &str = "enclii-system";
pub const TUNNEL_CONFIGMAP: &str = "enclii-tunnel-routes";

/// Publishes every running deployment's hostname into one ConfigMap the edge
/// tunnel watches. The whole table is rewritten from desired state each step,
/// so removed services cannot leave dangling routes.
pub struct TunnelRouteReconciler;

impl Reconciler for TunnelRouteReconciler {
    const KIND: &'static str = "tunnel-route";

    async fn list_due(&self, _state: &AppState) -> anyhow::Result<Vec<Uuid>> {
        // One global route table; a single synthetic key coalesces triggers.
        Ok(vec![Uuid::nil()])
    }

    async fn reconcile_one(&self, state: &AppState, _key: Uuid) -> anyhow::Result<()> {
        let routes = deployments::running_routes(&state.pool).await?;
        let desired = build_configmap(&routes);

        super::ensure_namespace(&state.kube, TUNNEL_NAMESPACE).await?;

        let api: Api<ConfigMap> = Api::namespaced(state.kube.clone(), TUNNEL_NAMESPACE);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(TUNNEL_CONFIGMAP, &params, &Patch::Apply(&desired))
            .await?;

        tracing::debug!(routes = routes.len(), "tunnel route table applied");
        Ok(())
    }
}

/// `hostname → namespace/service-env:port`, one entry per running route.
pub fn build_configmap(routes: &[RunningRoute]) -> ConfigMap {
    let mut data = BTreeMap::new();
    for route in routes {
        let hostname = route
            .hostname_template
            .replace("{service}", &route.service_name)
            .replace("{project}", &route.project_slug)
            .replace("{env}", &route.env_name);
        let backend = format!(
            "{}/{}-{}:{}",
            route.namespace, route.service_name, route.env_name, route.port
        );
        data.insert(hostname, backend);
    }

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(TUNNEL_CONFIGMAP.to_owned()),
            namespace: Some(TUNNEL_NAMESPACE.to_owned()),
            labels: Some(BTreeMap::from([(
                "enclii.dev/managed-by".to_owned(),
                "enclii".to_owned(),
            )])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(service: &str, env: &str) -> RunningRoute {
        RunningRoute {
            service_name: service.into(),
            project_slug: "acme".into(),
            env_name: env.into(),
            namespace: format!("acme-{env}"),
            hostname_template: "{service}.{env}.{project}.enclii.dev".into(),
            port: 8080,
        }
    }

    #[test]
    fn routes_render_host_to_backend() {
        let cm = build_configmap(&[route("api", "staging")]);
        let data = cm.data.as_ref().unwrap();
        assert_eq!(
            data["api.staging.acme.enclii.dev"],
            "acme-staging/api-staging:8080"
        );
    }

    #[test]
    fn empty_routes_produce_empty_table() {
        let cm = build_configmap(&[]);
        assert!(cm.data.as_ref().unwrap().is_empty());
    }

    #[test]
    fn table_is_full_rewrite() {
        let a = build_configmap(&[route("api", "staging"), route("web", "production")]);
        assert_eq!(a.data.as_ref().unwrap().len(), 2);

        // A dropped route simply disappears from the rendered table.
        let b = build_configmap(&[route("web", "production")]);
        assert_eq!(b.data.as_ref().unwrap().len(), 1);
        assert!(!b.data.as_ref().unwrap().contains_key("api.staging.acme.enclii.dev"));
    }
}
