use fred::interfaces::KeysInterface;

use crate::error::ApiError;

/// Traffic classes with independent counters, so a forge redelivery storm
/// cannot starve status polling and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Webhook,
    StatusPoll,
}

impl RateScope {
    fn key_part(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::StatusPoll => "status",
        }
    }
}

const WINDOW_SECS: i64 = 60;

/// Per-IP fixed-window limiter in Redis, one counter per `(scope, ip)` with
/// a one-minute expiry. Key expiry bounds memory under address churn; no
/// per-process map grows with the client population. A request with no
/// resolvable client address (no trusted proxy header, no socket info)
/// passes unlimited rather than sharing one global bucket.
pub async fn check_ip(
    valkey: &fred::clients::Pool,
    scope: RateScope,
    client_ip: Option<&str>,
    max_per_minute: u64,
) -> Result<(), ApiError> {
    let Some(ip) = client_ip else {
        return Ok(());
    };

    let key = format!("enclii:rate:{}:{ip}", scope.key_part());

    let count: u64 = valkey.incr(key.as_str()).await.map_err(ApiError::from)?;
    if count == 1 {
        let _: () = valkey
            .expire(key.as_str(), WINDOW_SECS, None)
            .await
            .map_err(ApiError::from)?;
    }

    if count > max_per_minute {
        tracing::warn!(%ip, scope = scope.key_part(), count, "rate limit exceeded");
        return Err(ApiError::TooManyRequests);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_use_distinct_counters() {
        assert_ne!(RateScope::Webhook.key_part(), RateScope::StatusPoll.key_part());
    }
}
