use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::StoreError;

/// Environments pre-created for every project.
pub const DEFAULT_ENVIRONMENTS: &[&str] = &["development", "staging", "production"];

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Environment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub namespace: String,
    pub hostname_template: String,
    pub created_at: DateTime<Utc>,
}

impl Environment {
    /// Render the ingress hostname for a service, e.g.
    /// `{service}.{project}.enclii.dev` → `api.acme.enclii.dev`.
    pub fn hostname_for(&self, project_slug: &str, service_name: &str) -> String {
        self.hostname_template
            .replace("{service}", service_name)
            .replace("{project}", project_slug)
            .replace("{env}", &self.name)
    }
}

/// Seed the standard environments for a fresh project, inside the project
/// creation transaction.
pub async fn seed_defaults(
    conn: &mut PgConnection,
    project_id: Uuid,
    project_slug: &str,
) -> Result<(), StoreError> {
    for name in DEFAULT_ENVIRONMENTS {
        let (namespace, template) = if *name == "production" {
            (
                format!("{project_slug}-prod"),
                "{service}.{project}.enclii.dev".to_owned(),
            )
        } else {
            (
                format!("{project_slug}-{name}"),
                "{service}.{env}.{project}.enclii.dev".to_owned(),
            )
        };

        sqlx::query(
            r#"
            INSERT INTO environments (project_id, name, namespace, hostname_template)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (project_id, name) DO NOTHING
            "#,
        )
        .bind(project_id)
        .bind(name)
        .bind(&namespace)
        .bind(&template)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Environment, StoreError> {
    sqlx::query_as::<_, Environment>("SELECT * FROM environments WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("environment".into()))
}

pub async fn get_by_name(
    pool: &PgPool,
    project_id: Uuid,
    name: &str,
) -> Result<Environment, StoreError> {
    sqlx::query_as::<_, Environment>(
        "SELECT * FROM environments WHERE project_id = $1 AND name = $2",
    )
    .bind(project_id)
    .bind(name)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("environment {name}")))
}

pub async fn list_for_project(
    pool: &PgPool,
    project_id: Uuid,
) -> Result<Vec<Environment>, StoreError> {
    let rows = sqlx::query_as::<_, Environment>(
        "SELECT * FROM environments WHERE project_id = $1 ORDER BY name",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_rendering() {
        let env = Environment {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "staging".into(),
            namespace: "acme-staging".into(),
            hostname_template: "{service}.{env}.{project}.enclii.dev".into(),
            created_at: Utc::now(),
        };
        assert_eq!(
            env.hostname_for("acme", "api"),
            "api.staging.acme.enclii.dev"
        );
    }
}
