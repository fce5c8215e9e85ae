use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use enclii::audit::{self, AuditLog};
use enclii::build::logbuf::LogBufferRegistry;
use enclii::config::Config;
use enclii::queue::WorkQueue;
use enclii::reconcile;
use enclii::store::{self, AppState};
use enclii::{api, build, ingest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("ENCLII_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    // TLS provider for kube-client and reqwest
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::load();
    let listen = config.listen.clone();

    let pool = store::pool::connect(&config).await?;
    let valkey = store::valkey::connect(&config.redis_url).await?;
    let artifacts = connect_artifact_store(&config)?;
    let kube = kube::Client::try_default().await?;

    let (audit_log, audit_rx) = AuditLog::new(
        config.audit_buffer_capacity,
        config.audit_overload_policy,
        config.audit_compliance_actions.clone(),
    );

    let state = AppState {
        pool: pool.clone(),
        valkey: valkey.clone(),
        artifacts,
        kube,
        config: Arc::new(config),
        audit: audit_log,
        log_bufs: LogBufferRegistry::default(),
        outbox_notify: Arc::new(tokio::sync::Notify::new()),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let queue = WorkQueue::new(valkey);

    // Background loops
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(audit::run_writer(pool.clone(), audit_rx)));
    tasks.push(tokio::spawn(enclii::queue::run_sweeper(
        queue.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(store::outbox::run_dispatcher(
        state.clone(),
        queue.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(build::dispatcher::run(
        state.clone(),
        queue.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(reconcile::run(
        reconcile::deployment::DeploymentReconciler,
        state.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(reconcile::run(
        reconcile::ingress::IngressReconciler,
        state.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(reconcile::run(
        reconcile::tunnel::TunnelRouteReconciler,
        state.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(reconcile::run(
        reconcile::addon::AddonReconciler,
        state.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(store::deliveries::run_retention(
        pool,
        state.config.delivery_retention_days,
        shutdown_rx,
    )));

    // Router
    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .merge(ingest::router())
        .merge(api::router())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(4 * 1024 * 1024))
        .with_state(state);

    let addr: SocketAddr = listen.parse()?;
    tracing::info!(%addr, "starting enclii control plane");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain background work: in-flight builds finish up to the grace window,
    // the rest returns to the queue via the visibility timeout.
    let _ = shutdown_tx.send(());
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        tracing::warn!("background tasks did not drain before the grace window");
    }

    tracing::info!("enclii stopped");
    Ok(())
}

fn connect_artifact_store(config: &Config) -> anyhow::Result<opendal::Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&config.artifact_store_uri)
        .access_key_id(&config.artifact_access_key)
        .secret_access_key(&config.artifact_secret_key)
        .bucket(&config.artifact_bucket)
        .region("us-east-1");

    Ok(opendal::Operator::new(builder)?.finish())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
