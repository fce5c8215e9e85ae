use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::token;
use crate::error::ApiError;
use crate::store::AppState;

/// Authenticated API caller, extracted from a bearer token. The streaming
/// endpoints also accept a `?token=` query parameter because browser
/// WebSocket clients cannot set headers.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token_id: Uuid,
    pub token_name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct TokenLookup {
    id: Uuid,
    name: String,
    expires_at: Option<DateTime<Utc>>,
}

impl FromRequestParts<AppState> for AuthToken {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw = extract_bearer_token(parts)
            .or_else(|| extract_query_token(parts))
            .ok_or(ApiError::Unauthorized)?;

        let row = lookup_token(&state.pool, &raw)
            .await?
            .ok_or(ApiError::Unauthorized)?;

        if let Some(expires_at) = row.expires_at
            && expires_at <= Utc::now()
        {
            return Err(ApiError::Unauthorized);
        }

        Ok(Self {
            token_id: row.id,
            token_name: row.name,
        })
    }
}

fn extract_bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_owned())
}

fn extract_query_token(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("token=")
            && !value.is_empty()
        {
            return Some(value.to_owned());
        }
    }
    None
}

/// Look up an API token by its raw value. Updates `last_used_at` on success.
async fn lookup_token(pool: &PgPool, raw_token: &str) -> Result<Option<TokenLookup>, ApiError> {
    let hash = token::hash_token(raw_token);

    let row = sqlx::query_as::<_, TokenLookup>(
        "SELECT id, name, expires_at FROM api_tokens WHERE token_hash = $1",
    )
    .bind(&hash)
    .fetch_optional(pool)
    .await?;

    if row.is_some() {
        // Fire-and-forget usage timestamp
        let pool = pool.clone();
        tokio::spawn(async move {
            let _ = sqlx::query("UPDATE api_tokens SET last_used_at = now() WHERE token_hash = $1")
                .bind(&hash)
                .execute(&pool)
                .await;
        });
    }

    Ok(row)
}

// ---------------------------------------------------------------------------
// Client IP
// ---------------------------------------------------------------------------

/// Best-effort client address for rate limiting. `X-Forwarded-For` is only
/// honored when the deployment declares a trusted reverse proxy.
#[derive(Debug, Clone)]
pub struct ClientIp(pub Option<String>);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(extract_ip(parts, state.config.trusted_proxies)))
    }
}

fn extract_ip(parts: &Parts, trust_proxy: bool) -> Option<String> {
    if trust_proxy
        && let Some(forwarded) = parts.headers.get("x-forwarded-for")
        && let Ok(val) = forwarded.to_str()
        && let Some(first_ip) = val.split(',').next()
    {
        return Some(first_ip.trim().to_owned());
    }
    parts
        .extensions
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn make_parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for &(k, v) in headers {
            builder = builder.header(k, v);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn bearer_token_valid() {
        let parts = make_parts("/v1/projects", &[("authorization", "Bearer encl_abc")]);
        assert_eq!(extract_bearer_token(&parts), Some("encl_abc".into()));
    }

    #[test]
    fn bearer_token_missing_or_empty() {
        assert_eq!(extract_bearer_token(&make_parts("/", &[])), None);
        assert_eq!(
            extract_bearer_token(&make_parts("/", &[("authorization", "Bearer ")])),
            None
        );
    }

    #[test]
    fn bearer_token_wrong_scheme() {
        let parts = make_parts("/", &[("authorization", "Basic dXNlcjpwYXNz")]);
        assert_eq!(extract_bearer_token(&parts), None);
    }

    #[test]
    fn query_token_fallback() {
        let parts = make_parts("/v1/services/x/logs/stream?token=encl_abc&foo=1", &[]);
        assert_eq!(extract_query_token(&parts), Some("encl_abc".into()));
    }

    #[test]
    fn query_token_absent() {
        assert_eq!(extract_query_token(&make_parts("/stream", &[])), None);
        assert_eq!(
            extract_query_token(&make_parts("/stream?token=", &[])),
            None
        );
    }

    #[test]
    fn ip_from_forwarded_for_trusted() {
        let parts = make_parts("/", &[("x-forwarded-for", "1.2.3.4, 5.6.7.8")]);
        assert_eq!(extract_ip(&parts, true), Some("1.2.3.4".into()));
    }

    #[test]
    fn ip_forwarded_for_ignored_when_not_trusted() {
        let parts = make_parts("/", &[("x-forwarded-for", "1.2.3.4")]);
        assert_eq!(extract_ip(&parts, false), None);
    }

    #[test]
    fn ip_from_connect_info() {
        let mut parts = make_parts("/", &[]);
        let addr: std::net::SocketAddr = "127.0.0.1:9000".parse().unwrap();
        parts.extensions.insert(axum::extract::ConnectInfo(addr));
        assert_eq!(extract_ip(&parts, false), Some("127.0.0.1".into()));
    }
}
