use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{Cursor, Page, StoreError};

/// Release lifecycle: `pending → building → ready | failed`.
/// Terminal states reject all further transitions with `Conflict`.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const BUILDING: &str = "building";
    pub const READY: &str = "ready";
    pub const FAILED: &str = "failed";

    pub fn is_terminal(status: &str) -> bool {
        matches!(status, READY | FAILED)
    }
}

/// Builder error messages are bounded before hitting the row.
pub const MAX_ERROR_LEN: usize = 4096;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Release {
    pub id: Uuid,
    pub service_id: Uuid,
    pub version: i64,
    pub git_sha: String,
    pub branch: String,
    pub image_uri: Option<String>,
    pub sbom_uri: Option<String>,
    pub signature_uri: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub build_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Release {
    pub fn is_terminal(&self) -> bool {
        status::is_terminal(&self.status)
    }
}

/// Create a release with the next monotonic version for the service.
/// Runs inside the caller's transaction so the webhook ingestor can pair it
/// with an outbox row atomically. The `(service_id, version)` unique key
/// turns a concurrent racer into `Conflict`; callers retry with a fresh read.
pub async fn create_next(
    conn: &mut PgConnection,
    service_id: Uuid,
    git_sha: &str,
    branch: &str,
) -> Result<Release, StoreError> {
    let release = sqlx::query_as::<_, Release>(
        r#"
        INSERT INTO releases (service_id, version, git_sha, branch, status)
        VALUES (
            $1,
            (SELECT COALESCE(MAX(version), 0) + 1 FROM releases WHERE service_id = $1),
            $2, $3, 'pending'
        )
        RETURNING *
        "#,
    )
    .bind(service_id)
    .bind(git_sha)
    .bind(branch)
    .fetch_one(conn)
    .await?;

    Ok(release)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Release, StoreError> {
    sqlx::query_as::<_, Release>("SELECT * FROM releases WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("release".into()))
}

/// Latest release for a `(service, commit)` pair — the aggregator's build stage.
pub async fn get_by_sha(
    pool: &PgPool,
    service_id: Uuid,
    git_sha: &str,
) -> Result<Option<Release>, StoreError> {
    let release = sqlx::query_as::<_, Release>(
        r#"
        SELECT * FROM releases
        WHERE service_id = $1 AND git_sha = $2
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(service_id)
    .bind(git_sha)
    .fetch_optional(pool)
    .await?;

    Ok(release)
}

/// Most recent `ready` release, used for rollback target validation.
pub async fn get_ready(pool: &PgPool, id: Uuid) -> Result<Release, StoreError> {
    let release = get(pool, id).await?;
    if release.status != status::READY {
        return Err(StoreError::Conflict(format!(
            "release {} is not ready (status {})",
            release.id, release.status
        )));
    }
    Ok(release)
}

pub async fn list_for_service(
    pool: &PgPool,
    service_id: Uuid,
    cursor: Option<Cursor>,
    limit: i64,
) -> Result<Page<Release>, StoreError> {
    let rows = match cursor {
        Some(c) => {
            sqlx::query_as::<_, Release>(
                r#"
                SELECT * FROM releases
                WHERE service_id = $1 AND (created_at, id) < ($2, $3)
                ORDER BY created_at DESC, id DESC
                LIMIT $4
                "#,
            )
            .bind(service_id)
            .bind(c.created_at)
            .bind(c.id)
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Release>(
                r#"
                SELECT * FROM releases
                WHERE service_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2
                "#,
            )
            .bind(service_id)
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(Page::from_rows(rows, limit, |r| Cursor {
        created_at: r.created_at,
        id: r.id,
    }))
}

// ---------------------------------------------------------------------------
// Guarded transitions (optimistic concurrency)
// ---------------------------------------------------------------------------

/// `pending → building`. The loser of a worker race observes `Conflict`
/// and must ack-drop without artifact writes.
pub async fn start_build(pool: &PgPool, id: Uuid) -> Result<Release, StoreError> {
    let updated = sqlx::query_as::<_, Release>(
        r#"
        UPDATE releases
        SET status = 'building', build_started_at = now()
        WHERE id = $1 AND status = 'pending'
        RETURNING *
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(release) => Ok(release),
        None => Err(transition_conflict(pool, id, status::BUILDING).await),
    }
}

/// `building → ready`. Writes all three artifact URIs and flips the state in
/// one statement so readers never observe a ready release without artifacts.
pub async fn complete(
    pool: &PgPool,
    id: Uuid,
    image_uri: &str,
    sbom_uri: &str,
    signature_uri: &str,
) -> Result<Release, StoreError> {
    if image_uri.is_empty() || sbom_uri.is_empty() || signature_uri.is_empty() {
        return Err(StoreError::Validation(
            "ready transition requires non-empty artifact URIs".into(),
        ));
    }

    let updated = sqlx::query_as::<_, Release>(
        r#"
        UPDATE releases
        SET status = 'ready', image_uri = $2, sbom_uri = $3, signature_uri = $4,
            completed_at = now()
        WHERE id = $1 AND status = 'building'
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(image_uri)
    .bind(sbom_uri)
    .bind(signature_uri)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(release) => Ok(release),
        None => Err(transition_conflict(pool, id, status::READY).await),
    }
}

/// `building → failed` (deterministic build failure) or `pending → failed`
/// (dead-lettered before any worker picked it up). `image_uri` stays null.
pub async fn fail(pool: &PgPool, id: Uuid, error_message: &str) -> Result<Release, StoreError> {
    let truncated = truncate_error(error_message);

    let updated = sqlx::query_as::<_, Release>(
        r#"
        UPDATE releases
        SET status = 'failed', error_message = $2, completed_at = now()
        WHERE id = $1 AND status IN ('pending', 'building')
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&truncated)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(release) => Ok(release),
        None => Err(transition_conflict(pool, id, status::FAILED).await),
    }
}

/// Distinguish "row gone" from "row in the wrong state" after a guarded
/// update matched nothing.
async fn transition_conflict(pool: &PgPool, id: Uuid, target: &str) -> StoreError {
    match get(pool, id).await {
        Ok(release) => StoreError::Conflict(format!(
            "release {} cannot transition {} -> {}",
            id, release.status, target
        )),
        Err(e) => e,
    }
}

pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_owned();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… (truncated)", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(status::is_terminal("ready"));
        assert!(status::is_terminal("failed"));
        assert!(!status::is_terminal("pending"));
        assert!(!status::is_terminal("building"));
    }

    #[test]
    fn short_error_untouched() {
        assert_eq!(truncate_error("boom"), "boom");
    }

    #[test]
    fn long_error_truncated() {
        let long = "x".repeat(MAX_ERROR_LEN + 100);
        let out = truncate_error(&long);
        assert!(out.len() < long.len());
        assert!(out.ends_with("(truncated)"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN);
        let out = truncate_error(&long);
        assert!(out.ends_with("(truncated)"));
    }

    proptest::proptest! {
        #[test]
        fn truncation_is_bounded_and_valid_utf8(message in ".{0,8192}") {
            let out = truncate_error(&message);
            proptest::prop_assert!(out.len() <= MAX_ERROR_LEN + "… (truncated)".len());
            proptest::prop_assert!(std::str::from_utf8(out.as_bytes()).is_ok());
        }
    }
}
