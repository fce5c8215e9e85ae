use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Cursor, Page, StoreError};

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Service {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub dockerfile: Option<String>,
    pub buildpack: Option<String>,
    pub port: i32,
    pub env_vars: serde_json::Value,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub replicas: serde_json::Value,
    pub build_branch: Option<String>,
    pub auto_deploy_env: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Desired replica count for an environment name, defaulting to 1.
    pub fn replicas_for(&self, env_name: &str) -> i32 {
        self.replicas
            .get(env_name)
            .and_then(serde_json::Value::as_i64)
            .map(|n| i32::try_from(n).unwrap_or(1))
            .unwrap_or(1)
    }

    /// Branch that triggers builds: the service override or the project default.
    pub fn matches_branch(&self, branch: &str, project_default: &str) -> bool {
        match &self.build_branch {
            Some(b) => b == branch,
            None => branch == project_default,
        }
    }
}

pub struct NewService<'a> {
    pub project_id: Uuid,
    pub name: &'a str,
    pub dockerfile: Option<&'a str>,
    pub buildpack: Option<&'a str>,
    pub port: i32,
    pub env_vars: serde_json::Value,
    pub build_branch: Option<&'a str>,
    pub auto_deploy_env: Option<&'a str>,
}

pub async fn create(pool: &PgPool, new: &NewService<'_>) -> Result<Service, StoreError> {
    let service = sqlx::query_as::<_, Service>(
        r#"
        INSERT INTO services
            (project_id, name, dockerfile, buildpack, port, env_vars, build_branch, auto_deploy_env)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(new.project_id)
    .bind(new.name)
    .bind(new.dockerfile)
    .bind(new.buildpack)
    .bind(new.port)
    .bind(&new.env_vars)
    .bind(new.build_branch)
    .bind(new.auto_deploy_env)
    .fetch_one(pool)
    .await?;

    Ok(service)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Service, StoreError> {
    sqlx::query_as::<_, Service>("SELECT * FROM services WHERE id = $1 AND is_active = true")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("service".into()))
}

pub async fn list_for_project(
    pool: &PgPool,
    project_id: Uuid,
    cursor: Option<Cursor>,
    limit: i64,
) -> Result<Page<Service>, StoreError> {
    let rows = match cursor {
        Some(c) => {
            sqlx::query_as::<_, Service>(
                r#"
                SELECT * FROM services
                WHERE project_id = $1 AND is_active = true AND (created_at, id) < ($2, $3)
                ORDER BY created_at DESC, id DESC
                LIMIT $4
                "#,
            )
            .bind(project_id)
            .bind(c.created_at)
            .bind(c.id)
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Service>(
                r#"
                SELECT * FROM services
                WHERE project_id = $1 AND is_active = true
                ORDER BY created_at DESC, id DESC
                LIMIT $2
                "#,
            )
            .bind(project_id)
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(Page::from_rows(rows, limit, |s| Cursor {
        created_at: s.created_at,
        id: s.id,
    }))
}

pub struct ServiceUpdate<'a> {
    pub dockerfile: Option<&'a str>,
    pub buildpack: Option<&'a str>,
    pub port: Option<i32>,
    pub env_vars: Option<serde_json::Value>,
    pub replicas: Option<serde_json::Value>,
    pub build_branch: Option<&'a str>,
    pub auto_deploy_env: Option<&'a str>,
}

/// Mutate the service spec. `build_config` changes only take effect on the
/// next release; nothing here touches existing releases.
pub async fn update(
    pool: &PgPool,
    id: Uuid,
    upd: &ServiceUpdate<'_>,
) -> Result<Service, StoreError> {
    sqlx::query_as::<_, Service>(
        r#"
        UPDATE services SET
            dockerfile = COALESCE($2, dockerfile),
            buildpack = COALESCE($3, buildpack),
            port = COALESCE($4, port),
            env_vars = COALESCE($5, env_vars),
            replicas = COALESCE($6, replicas),
            build_branch = COALESCE($7, build_branch),
            auto_deploy_env = COALESCE($8, auto_deploy_env),
            updated_at = now()
        WHERE id = $1 AND is_active = true
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(upd.dockerfile)
    .bind(upd.buildpack)
    .bind(upd.port)
    .bind(&upd.env_vars)
    .bind(&upd.replicas)
    .bind(upd.build_branch)
    .bind(upd.auto_deploy_env)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound("service".into()))
}

/// Addon connection fields bound to a service, keyed for env injection.
#[derive(Debug, sqlx::FromRow)]
pub struct BoundAddon {
    pub addon_id: Uuid,
    pub addon_type: String,
    pub env_prefix: String,
    pub connection: Option<serde_json::Value>,
}

pub async fn bound_addons(pool: &PgPool, service_id: Uuid) -> Result<Vec<BoundAddon>, StoreError> {
    let rows = sqlx::query_as::<_, BoundAddon>(
        r#"
        SELECT a.id AS addon_id, a.addon_type, b.env_prefix, a.connection
        FROM addon_bindings b
        JOIN addons a ON a.id = b.addon_id AND a.status = 'ready'
        WHERE b.service_id = $1
        "#,
    )
    .bind(service_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(replicas: serde_json::Value, build_branch: Option<&str>) -> Service {
        Service {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "api".into(),
            dockerfile: None,
            buildpack: None,
            port: 8080,
            env_vars: serde_json::json!({}),
            cpu_request: "250m".into(),
            cpu_limit: "1".into(),
            memory_request: "256Mi".into(),
            memory_limit: "1Gi".into(),
            replicas,
            build_branch: build_branch.map(Into::into),
            auto_deploy_env: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn replicas_for_env() {
        let s = service(serde_json::json!({"production": 3, "staging": 2}), None);
        assert_eq!(s.replicas_for("production"), 3);
        assert_eq!(s.replicas_for("staging"), 2);
        assert_eq!(s.replicas_for("development"), 1);
    }

    #[test]
    fn branch_policy_uses_override_then_default() {
        let s = service(serde_json::json!({}), Some("release"));
        assert!(s.matches_branch("release", "main"));
        assert!(!s.matches_branch("main", "main"));

        let s = service(serde_json::json!({}), None);
        assert!(s.matches_branch("main", "main"));
        assert!(!s.matches_branch("feature", "main"));
    }
}
