use std::sync::Arc;

use enclii::audit::AuditLog;
use enclii::build::logbuf::LogBufferRegistry;
use enclii::config::Config;
use enclii::store::AppState;

/// App state wired to unreachable backends. Good enough for exercising the
/// request paths that reject before touching a store (auth, signatures,
/// routing) and for asserting that store-dependent paths degrade to 503.
pub fn offline_state() -> AppState {
    let _ = rustls::crypto::ring::default_provider().install_default();

    // SAFETY of construction only: nothing connects until first use.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect_lazy("postgres://enclii:x@127.0.0.1:1/enclii")
        .expect("lazy pool");

    let valkey_config =
        fred::types::config::Config::from_url("redis://127.0.0.1:1").expect("redis url");
    let valkey =
        fred::clients::Pool::new(valkey_config, None, None, None, 1).expect("redis pool");

    let artifacts = opendal::Operator::new(
        opendal::services::S3::default()
            .endpoint("http://127.0.0.1:1")
            .access_key_id("x")
            .secret_access_key("x")
            .bucket("test")
            .region("us-east-1"),
    )
    .expect("operator")
    .finish();

    let kube_config = kube::Config::new("http://127.0.0.1:1".parse().expect("url"));
    let kube = kube::Client::try_from(kube_config).expect("kube client");

    let mut config = test_config();
    config.github_webhook_secret = Some("gh-secret".into());
    config.gitlab_webhook_secret = Some("gl-secret".into());

    let (audit, _audit_rx) = AuditLog::new(
        64,
        config.audit_overload_policy,
        config.audit_compliance_actions.clone(),
    );

    AppState {
        pool,
        valkey,
        artifacts,
        kube,
        config: Arc::new(config),
        audit,
        log_bufs: LogBufferRegistry::default(),
        outbox_notify: Arc::new(tokio::sync::Notify::new()),
    }
}

fn test_config() -> Config {
    // Env-free defaults; fields under test are overridden by callers.
    Config::load()
}

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .merge(enclii::ingest::router())
        .merge(enclii::api::router())
        .with_state(state)
}
