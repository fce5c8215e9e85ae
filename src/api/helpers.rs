use serde::{Deserialize, Serialize};

use crate::audit::AuditEvent;
use crate::error::ApiError;
use crate::store::{AppState, Cursor, Page};

/// Keyset pagination query: `?cursor=<opaque>&limit=<n>`.
#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

impl PageParams {
    pub fn decode(&self) -> Result<(Option<Cursor>, i64), ApiError> {
        let cursor = match &self.cursor {
            Some(raw) => Some(
                Cursor::decode(raw).ok_or_else(|| ApiError::BadRequest("invalid cursor".into()))?,
            ),
            None => None,
        };
        Ok((cursor, Cursor::clamp_limit(self.limit)))
    }
}

#[derive(Debug, Serialize)]
pub struct PageResponse<T: Serialize> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T: Serialize> PageResponse<T> {
    pub fn from_page(page: Page<T>) -> Self {
        Self {
            items: page.items,
            next_cursor: page.next.map(|c| c.encode()),
        }
    }
}

/// Offer an audit event, honoring the fail-closed contract: when the buffer
/// refuses a compliance-tagged record, the API operation fails with 503
/// instead of losing it.
pub fn record_audit(state: &AppState, event: AuditEvent) -> Result<(), ApiError> {
    state
        .audit
        .record(event)
        .map_err(|e| ApiError::ServiceUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_cursor_rejected() {
        let params = PageParams {
            cursor: Some("garbage".into()),
            limit: None,
        };
        assert!(params.decode().is_err());
    }

    #[test]
    fn empty_params_default() {
        let params = PageParams {
            cursor: None,
            limit: Some(10),
        };
        let (cursor, limit) = params.decode().unwrap();
        assert!(cursor.is_none());
        assert_eq!(limit, 10);
    }
}
