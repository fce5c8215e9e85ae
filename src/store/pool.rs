use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::Config;

/// Connect and migrate. The pool is shared by the API handlers, the build
/// workers, and every reconciler, so it is sized off the build worker count
/// rather than a fixed number; the short acquire timeout keeps a saturated
/// pool surfacing as a transient store error instead of a stalled request.
#[tracing::instrument(skip(config), err)]
pub async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(pool_size(config.build_worker_count))
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;

    tracing::info!(
        max_connections = pool.options().get_max_connections(),
        "connected to postgres"
    );

    sqlx::migrate!().run(&pool).await?;
    tracing::info!("migrations applied");

    Ok(pool)
}

/// One connection per build worker plus headroom for the API surface and the
/// control loops, bounded so a large worker count cannot exhaust the server.
fn pool_size(build_workers: usize) -> u32 {
    let workers = u32::try_from(build_workers).unwrap_or(u32::MAX);
    (workers + 8).clamp(10, 50)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_scales_with_workers() {
        assert_eq!(pool_size(4), 12);
        assert_eq!(pool_size(16), 24);
    }

    #[test]
    fn pool_size_has_floor_and_cap() {
        assert_eq!(pool_size(0), 10);
        assert_eq!(pool_size(1), 10);
        assert_eq!(pool_size(500), 50);
    }
}
