pub mod addon;
pub mod backoff;
pub mod deployment;
pub mod ingress;
pub mod tunnel;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use uuid::Uuid;

use crate::store::AppState;

use backoff::BackoffTracker;

/// Backoff cap shared by all control loops.
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// One level-based control loop. A reconciler lists the keys that currently
/// need attention and converges one key per step; the shared runner supplies
/// ticking, trigger coalescing, and per-key backoff.
pub trait Reconciler: Send + Sync + 'static {
    const KIND: &'static str;

    /// Keys with desired-state rows in scope this tick.
    fn list_due(
        &self,
        state: &AppState,
    ) -> impl Future<Output = anyhow::Result<Vec<Uuid>>> + Send;

    /// One idempotent step: compute target state, diff against observed,
    /// apply a minimal change, write observed state back. Re-running with
    /// identical inputs must be a no-op.
    fn reconcile_one(
        &self,
        state: &AppState,
        key: Uuid,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Drive a reconciler until shutdown: periodic tick, at most one in-flight
/// step per key (extra triggers coalesce), exponential backoff per failing
/// key. A slow step on one key never stalls the others.
pub async fn run<R: Reconciler>(
    reconciler: R,
    state: AppState,
    mut shutdown: tokio::sync::watch::Receiver<()>,
) {
    let reconciler = Arc::new(reconciler);
    let in_flight: Arc<DashSet<Uuid>> = Arc::new(DashSet::new());
    let backoff = BackoffTracker::new(BACKOFF_BASE, BACKOFF_CAP);
    let interval = Duration::from_secs(state.config.reconcile_interval_secs.max(1));

    tracing::info!(kind = R::KIND, "reconciler started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!(kind = R::KIND, "reconciler shutting down");
                break;
            }
            () = tokio::time::sleep(interval) => {
                let keys = match reconciler.list_due(&state).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        tracing::error!(kind = R::KIND, error = %e, "list_due failed");
                        continue;
                    }
                };

                for key in keys {
                    if backoff.should_skip(key) {
                        continue;
                    }
                    // Coalesce: a step already running for this key absorbs
                    // this trigger.
                    if !in_flight.insert(key) {
                        continue;
                    }

                    let reconciler = reconciler.clone();
                    let state = state.clone();
                    let in_flight = in_flight.clone();
                    let backoff = backoff.clone();

                    tokio::spawn(async move {
                        match reconciler.reconcile_one(&state, key).await {
                            Ok(()) => backoff.record_success(key),
                            Err(e) => {
                                tracing::warn!(
                                    kind = R::KIND,
                                    %key,
                                    error = %e,
                                    "reconcile step failed"
                                );
                                backoff.record_failure(key);
                            }
                        }
                        in_flight.remove(&key);
                    });
                }
            }
        }
    }
}

/// Namespaces are created on demand and shared; AlreadyExists is success.
pub async fn ensure_namespace(kube: &kube::Client, name: &str) -> anyhow::Result<()> {
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::PostParams;

    let api: kube::Api<Namespace> = kube::Api::all(kube.clone());
    let ns = Namespace {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_owned()),
            ..Default::default()
        },
        ..Default::default()
    };

    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
