pub mod addons;
pub mod deliveries;
pub mod deployments;
pub mod environments;
pub mod outbox;
pub mod pool;
pub mod projects;
pub mod releases;
pub mod services;
pub mod valkey;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::build::logbuf::LogBufferRegistry;
use crate::config::Config;

/// Shared application state handed to every handler and background loop.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub valkey: fred::clients::Pool,
    pub artifacts: opendal::Operator,
    pub kube: kube::Client,
    pub config: Arc<Config>,
    pub audit: AuditLog,
    pub log_bufs: LogBufferRegistry,
    /// Wakes the outbox dispatcher after a webhook commits.
    pub outbox_notify: Arc<tokio::sync::Notify>,
}

/// Tagged failure for every store operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal store error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("resource not found".into()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("23505") => Self::Conflict("resource already exists".into()),
                Some("23503") => Self::Conflict("referenced resource missing".into()),
                _ => {
                    tracing::error!(error = %err, "database error");
                    Self::Fatal(err.into())
                }
            },
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::Transient(format!("database unavailable: {err}"))
            }
            _ => {
                tracing::error!(error = %err, "database error");
                Self::Fatal(err.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Keyset pagination
// ---------------------------------------------------------------------------

/// `(created_at, id)` cursor for parent→child list operations.
/// Unbounded lists are not exposed; `limit` is capped at [`Cursor::MAX_LIMIT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 100;

    pub fn encode(&self) -> String {
        format!("{}.{}", self.created_at.timestamp_micros(), self.id)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let (micros, id) = raw.split_once('.')?;
        let micros: i64 = micros.parse().ok()?;
        Some(Self {
            created_at: DateTime::from_timestamp_micros(micros)?,
            id: id.parse().ok()?,
        })
    }

    pub fn clamp_limit(limit: Option<i64>) -> i64 {
        limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }
}

/// A page of rows plus the cursor for the next page (None when exhausted).
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Cursor>,
}

impl<T> Page<T> {
    /// Build a page from rows fetched with `limit + 1`, using the accessor to
    /// derive the next cursor from the last returned row.
    pub fn from_rows(mut rows: Vec<T>, limit: i64, cursor_of: impl Fn(&T) -> Cursor) -> Self {
        let has_more = rows.len() as i64 > limit;
        if has_more {
            rows.truncate(limit as usize);
        }
        let next = has_more.then(|| rows.last().map(&cursor_of)).flatten();
        Self { items: rows, next }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let c = Cursor {
            created_at: DateTime::from_timestamp_micros(1_720_000_000_123_456).unwrap(),
            id: Uuid::new_v4(),
        };
        assert_eq!(Cursor::decode(&c.encode()), Some(c));
    }

    #[test]
    fn cursor_decode_rejects_garbage() {
        assert_eq!(Cursor::decode("nope"), None);
        assert_eq!(Cursor::decode("123"), None);
        assert_eq!(Cursor::decode("abc.def"), None);
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(Cursor::clamp_limit(None), 50);
        assert_eq!(Cursor::clamp_limit(Some(10_000)), 100);
        assert_eq!(Cursor::clamp_limit(Some(0)), 1);
    }

    proptest::proptest! {
        #[test]
        fn cursor_round_trips_for_any_instant(micros in 0i64..=4_102_444_800_000_000i64, bytes in proptest::array::uniform16(0u8..)) {
            let c = Cursor {
                created_at: DateTime::from_timestamp_micros(micros).unwrap(),
                id: Uuid::from_bytes(bytes),
            };
            proptest::prop_assert_eq!(Cursor::decode(&c.encode()), Some(c));
        }
    }

    #[test]
    fn page_detects_more_rows() {
        let rows: Vec<(DateTime<Utc>, Uuid)> = (0..4)
            .map(|i| {
                (
                    DateTime::from_timestamp_micros(1_000_000 + i).unwrap(),
                    Uuid::new_v4(),
                )
            })
            .collect();

        let page = Page::from_rows(rows.clone(), 3, |(t, id)| Cursor {
            created_at: *t,
            id: *id,
        });
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.next.map(|c| c.id), Some(rows[2].1));

        let page = Page::from_rows(rows[..2].to_vec(), 3, |(t, id)| Cursor {
            created_at: *t,
            id: *id,
        });
        assert_eq!(page.items.len(), 2);
        assert!(page.next.is_none());
    }
}
