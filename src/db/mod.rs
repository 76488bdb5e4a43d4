//! Tenant-scoped read access to items, events, event types and rules.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::models::{EventTypeCatalog, Item, Rule};

pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::MemoryStore;
pub use postgres::{create_pool, PgRecStore};
pub use retry::with_retry;

/// Store failures, classified for retry
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("permanent store failure: {0}")]
    Permanent(String),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    Unavailable {
        operation: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("request canceled")]
    Canceled,
}

impl StoreError {
    /// Worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Transient(_))
    }

    /// Transient failures that survived the retry budget
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. } | StoreError::Timeout(_) | StoreError::Transient(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                StoreError::Transient(err.to_string())
            }
            sqlx::Error::Database(db) => {
                let transient = db.code().is_some_and(|code| {
                    code.starts_with("08")
                        || matches!(code.as_ref(), "40001" | "40P01" | "53300" | "57P01")
                });
                if transient {
                    StoreError::Transient(err.to_string())
                } else {
                    StoreError::Permanent(err.to_string())
                }
            }
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

/// The (org, namespace) partition every read is confined to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantScope {
    pub org_id: Uuid,
    pub namespace: String,
}

impl TenantScope {
    pub fn new(org_id: Uuid, namespace: impl Into<String>) -> Self {
        Self {
            org_id,
            namespace: namespace.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PopularItem {
    pub item_id: String,
    pub score: f64,
    pub last_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CoVisitor {
    pub item_id: String,
    /// Distinct users who touched both the seed and this item
    pub count: f64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RecentItem {
    pub item_id: String,
    pub last_ts: DateTime<Utc>,
    pub best_event_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct HoldoutSample {
    pub user_id: String,
    pub item_id: String,
    pub ts: DateTime<Utc>,
    pub event_count: i64,
}

/// Parameters for the time-decayed popularity read
#[derive(Debug, Clone, PartialEq)]
pub struct PopularityQuery {
    pub since: DateTime<Utc>,
    pub half_life_days: f64,
    pub limit: usize,
    pub exclude_item_ids: Vec<String>,
    pub weights: EventTypeCatalog,
}

/// Read-only projections used by the recommendation pipeline.
///
/// Every read is confined to one tenant and only sees events with
/// `ts <= ctx.now`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecStore: Send + Sync {
    /// Tenant catalog merged over the defaults
    async fn event_type_weights(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
    ) -> Result<EventTypeCatalog, StoreError>;

    /// Items by decayed, event-weighted interaction mass, best first.
    /// Ties go to the newer last event, then the smaller item id.
    async fn top_popular(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        query: &PopularityQuery,
    ) -> Result<Vec<PopularItem>, StoreError>;

    /// Items sharing users with `seed_item_id` since `since`, highest count first
    async fn co_visitors(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        seed_item_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CoVisitor>, StoreError>;

    /// Distinct items the user touched, newest first
    async fn user_recent_items(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
        weights: &EventTypeCatalog,
    ) -> Result<Vec<RecentItem>, StoreError>;

    /// Tag -> summed event-type weight over the user's events
    async fn user_tag_profile(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        since: DateTime<Utc>,
        weights: &EventTypeCatalog,
    ) -> Result<HashMap<String, f64>, StoreError>;

    async fn items_by_ids(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        ids: &[String],
    ) -> Result<HashMap<String, Item>, StoreError>;

    /// Available items carrying at least one of `tags`, newest first
    async fn items_with_any_tag(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Item>, StoreError>;

    /// Active rules for the surface, priority desc then rule id
    async fn rules_for(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        surface: &str,
    ) -> Result<Vec<Rule>, StoreError>;

    async fn recent_event_items(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        event_types: &[i16],
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError>;

    /// Each qualifying user's most recent event, newest first
    async fn holdout_samples(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        since: DateTime<Utc>,
        min_events: usize,
        limit: usize,
    ) -> Result<Vec<HoldoutSample>, StoreError>;
}

/// `exp(-ln 2 * age / half_life)`; events from the future weigh nothing.
pub fn decay_factor(age: chrono::Duration, half_life_days: f64) -> f64 {
    if age < chrono::Duration::zero() || half_life_days <= 0.0 {
        return 0.0;
    }
    let age_days = age.num_milliseconds() as f64 / 86_400_000.0;
    (-std::f64::consts::LN_2 * age_days / half_life_days).exp()
}

/// Converts a fractional day count into a chrono duration
pub fn days(value: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((value * 86_400_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_halves_at_half_life() {
        let half = decay_factor(chrono::Duration::days(7), 7.0);
        assert!((half - 0.5).abs() < 1e-9);
        assert_eq!(decay_factor(chrono::Duration::zero(), 7.0), 1.0);
        assert_eq!(decay_factor(chrono::Duration::days(-1), 7.0), 0.0);
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Timeout(Duration::from_millis(5)).is_transient());
        assert!(StoreError::Transient("reset".into()).is_transient());
        assert!(!StoreError::Permanent("syntax".into()).is_transient());
        assert!(!StoreError::Canceled.is_transient());

        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err, StoreError::Permanent(sqlx::Error::RowNotFound.to_string()));
    }

    #[test]
    fn test_days_conversion() {
        assert_eq!(days(1.5), chrono::Duration::hours(36));
    }
}
