use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::error;
use uuid::Uuid;

use super::{
    with_retry, CoVisitor, HoldoutSample, PopularItem, PopularityQuery, RecStore, RecentItem,
    StoreError, TenantScope,
};
use crate::config::{Config, StoreOptions};
use crate::context::RequestContext;
use crate::models::{EventTypeCatalog, EventTypeInfo, Item, Rule, RuleAction, RuleTarget};

/// Creates a PostgreSQL connection pool
///
/// The pool caps concurrent connections and bounds how long a request waits
/// for one; an exhausted pool surfaces as a transient store error.
pub async fn create_pool(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_millis(config.db_acquire_timeout_ms))
        .connect(&config.database_url)
        .await?;

    Ok(pool)
}

const EVENT_TYPES_SQL: &str = r#"
SELECT type, name, weight, is_conversion
  FROM event_types
 WHERE org_id = $1 AND namespace = $2
"#;

const TOP_POPULAR_SQL: &str = r#"
WITH w AS (
    SELECT * FROM unnest($3::int2[], $4::float8[]) AS w(type, weight)
), scored AS (
    SELECT e.item_id,
           SUM(w.weight * EXP(
               -LN(2) * (EXTRACT(EPOCH FROM ($5::timestamptz - e.ts))::float8 / 86400.0) / $6
           )) AS score,
           MAX(e.ts) AS last_ts
      FROM events e
      JOIN w ON w.type = e.type
     WHERE e.org_id = $1
       AND e.namespace = $2
       AND e.ts >= $7
       AND e.ts <= $5
       AND NOT (e.item_id = ANY($8::text[]))
     GROUP BY e.item_id
)
SELECT item_id, score, last_ts
  FROM scored
 WHERE score > 0
 ORDER BY score DESC, last_ts DESC, item_id ASC
 LIMIT $9
"#;

const CO_VISITORS_SQL: &str = r#"
WITH seed_users AS (
    SELECT DISTINCT user_id
      FROM events
     WHERE org_id = $1 AND namespace = $2 AND item_id = $3 AND ts >= $4 AND ts <= $5
)
SELECT e.item_id, COUNT(DISTINCT e.user_id)::float8 AS count
  FROM events e
  JOIN seed_users s ON s.user_id = e.user_id
 WHERE e.org_id = $1
   AND e.namespace = $2
   AND e.item_id <> $3
   AND e.ts >= $4
   AND e.ts <= $5
 GROUP BY e.item_id
 ORDER BY count DESC, e.item_id ASC
 LIMIT $6
"#;

const USER_RECENT_ITEMS_SQL: &str = r#"
SELECT e.item_id,
       MAX(e.ts) AS last_ts,
       MAX(COALESCE(w.weight, 0))::float8 AS best_event_weight
  FROM events e
  LEFT JOIN unnest($6::int2[], $7::float8[]) AS w(type, weight) ON w.type = e.type
 WHERE e.org_id = $1
   AND e.namespace = $2
   AND e.user_id = $3
   AND e.ts >= $4
   AND e.ts <= $5
 GROUP BY e.item_id
 ORDER BY last_ts DESC, e.item_id ASC
 LIMIT $8
"#;

const USER_TAG_PROFILE_SQL: &str = r#"
SELECT LOWER(tag) AS tag, SUM(w.weight)::float8 AS weight
  FROM events e
  JOIN items i
    ON i.org_id = e.org_id AND i.namespace = e.namespace AND i.item_id = e.item_id
  JOIN unnest($6::int2[], $7::float8[]) AS w(type, weight) ON w.type = e.type
 CROSS JOIN LATERAL unnest(i.tags) AS tag
 WHERE e.org_id = $1
   AND e.namespace = $2
   AND e.user_id = $3
   AND e.ts >= $4
   AND e.ts <= $5
 GROUP BY LOWER(tag)
"#;

const ITEMS_BY_IDS_SQL: &str = r#"
SELECT item_id, available, price, tags, props, created_at
  FROM items
 WHERE org_id = $1 AND namespace = $2 AND item_id = ANY($3::text[])
"#;

const ITEMS_WITH_ANY_TAG_SQL: &str = r#"
SELECT i.item_id, i.available, i.price, i.tags, i.props, i.created_at
  FROM items i
 WHERE i.org_id = $1
   AND i.namespace = $2
   AND i.available
   AND EXISTS (SELECT 1 FROM unnest(i.tags) AS t WHERE LOWER(t) = ANY($3::text[]))
 ORDER BY i.created_at DESC, i.item_id ASC
 LIMIT $4
"#;

const RULES_FOR_SQL: &str = r#"
SELECT rule_id, namespace, surface, target_type, target_value, item_ids,
       action, boost_value, pin_position, max_pins, priority, enabled,
       valid_from, valid_until
  FROM rules
 WHERE org_id = $1
   AND namespace = $2
   AND enabled
   AND (surface = '' OR surface = '*' OR LOWER(surface) = LOWER($3))
   AND (valid_from IS NULL OR valid_from <= $4)
   AND (valid_until IS NULL OR $4 < valid_until)
 ORDER BY priority DESC, rule_id ASC
"#;

const RECENT_EVENT_ITEMS_SQL: &str = r#"
SELECT DISTINCT item_id
  FROM events
 WHERE org_id = $1
   AND namespace = $2
   AND user_id = $3
   AND type = ANY($4::int2[])
   AND ts >= $5
   AND ts <= $6
"#;

const HOLDOUT_SAMPLES_SQL: &str = r#"
WITH ranked AS (
    SELECT user_id, item_id, ts,
           ROW_NUMBER() OVER (PARTITION BY user_id ORDER BY ts DESC, item_id ASC) AS rn,
           COUNT(*) OVER (PARTITION BY user_id) AS event_count
      FROM events
     WHERE org_id = $1 AND namespace = $2 AND ts >= $3 AND ts <= $4
)
SELECT user_id, item_id, ts, event_count
  FROM ranked
 WHERE rn = 1 AND event_count >= $5
 ORDER BY ts DESC, user_id ASC
 LIMIT $6
"#;

#[derive(sqlx::FromRow)]
struct EventTypeRow {
    #[sqlx(rename = "type")]
    code: i16,
    name: String,
    weight: f64,
    is_conversion: bool,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    item_id: String,
    available: bool,
    price: Option<f64>,
    tags: Vec<String>,
    props: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Item {
            item_id: row.item_id,
            available: row.available,
            price: row.price,
            tags: row.tags,
            props: row.props.unwrap_or(serde_json::Value::Null),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    rule_id: Uuid,
    namespace: String,
    surface: String,
    target_type: String,
    target_value: Option<String>,
    item_ids: Option<Vec<String>>,
    action: String,
    boost_value: Option<f64>,
    pin_position: Option<i32>,
    max_pins: Option<i32>,
    priority: i32,
    enabled: bool,
    valid_from: Option<DateTime<Utc>>,
    valid_until: Option<DateTime<Utc>>,
}

impl TryFrom<RuleRow> for Rule {
    type Error = String;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let value = row.target_value.clone().unwrap_or_default();
        let target = match row.target_type.to_lowercase().as_str() {
            "tag" if !value.is_empty() => RuleTarget::Tag(value),
            "brand" if !value.is_empty() => RuleTarget::Brand(value),
            "category" if !value.is_empty() => RuleTarget::Category(value),
            "items" | "item" => RuleTarget::Items(row.item_ids.clone().unwrap_or_default()),
            other => return Err(format!("unsupported target {:?}", other)),
        };

        let action = match row.action.to_lowercase().as_str() {
            "block" => RuleAction::Block,
            "pin" => match row.pin_position {
                Some(position) if position >= 1 => RuleAction::Pin {
                    position: position as usize,
                },
                _ => return Err("pin without a positive position".to_string()),
            },
            "boost" => match row.boost_value {
                Some(strength) if strength.is_finite() && strength > -1.0 => {
                    RuleAction::Boost { strength }
                }
                _ => return Err("boost without a usable strength".to_string()),
            },
            other => return Err(format!("unsupported action {:?}", other)),
        };

        let max_pins = match row.max_pins {
            None => None,
            Some(max) if max >= 0 => Some(max as usize),
            Some(max) => return Err(format!("negative max_pins {}", max)),
        };

        Ok(Rule {
            rule_id: row.rule_id,
            namespace: row.namespace,
            surface: row.surface,
            target,
            action,
            priority: row.priority,
            max_pins,
            enabled: row.enabled,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
        })
    }
}

/// Converts stored rule rows, failing the read on the first malformed one.
fn parse_rules(rows: Vec<RuleRow>) -> Result<Vec<Rule>, StoreError> {
    rows.into_iter()
        .map(|row| {
            let rule_id = row.rule_id;
            Rule::try_from(row).map_err(|reason| {
                error!(%rule_id, reason = %reason, "Malformed rule in store");
                StoreError::Permanent(format!("malformed rule {}: {}", rule_id, reason))
            })
        })
        .collect()
}

/// `RecStore` backed by the shared Postgres pool
#[derive(Clone)]
pub struct PgRecStore {
    pool: PgPool,
    options: StoreOptions,
}

impl PgRecStore {
    pub fn new(pool: PgPool, options: StoreOptions) -> Self {
        Self { pool, options }
    }
}

fn limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl RecStore for PgRecStore {
    async fn event_type_weights(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
    ) -> Result<EventTypeCatalog, StoreError> {
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;

        let rows: Vec<EventTypeRow> =
            with_retry(ctx, &self.options, "event_type_weights", move || async move {
                sqlx::query_as::<_, EventTypeRow>(EVENT_TYPES_SQL)
                    .bind(org_id)
                    .bind(namespace)
                    .fetch_all(pool)
                    .await
                    .map_err(StoreError::from)
            })
            .await?;

        Ok(rows
            .into_iter()
            .fold(EventTypeCatalog::defaults(), |catalog, row| {
                catalog.with_override(
                    row.code,
                    EventTypeInfo {
                        name: row.name,
                        weight: row.weight,
                        is_conversion: row.is_conversion,
                    },
                )
            }))
    }

    async fn top_popular(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        query: &PopularityQuery,
    ) -> Result<Vec<PopularItem>, StoreError> {
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;
        let now = ctx.now;
        let (codes, weights) = query.weights.as_arrays();
        let (codes, weights) = (codes.as_slice(), weights.as_slice());
        let exclude = query.exclude_item_ids.as_slice();

        with_retry(ctx, &self.options, "top_popular", move || async move {
            sqlx::query_as::<_, PopularItem>(TOP_POPULAR_SQL)
                .bind(org_id)
                .bind(namespace)
                .bind(codes)
                .bind(weights)
                .bind(now)
                .bind(query.half_life_days)
                .bind(query.since)
                .bind(exclude)
                .bind(limit(query.limit))
                .fetch_all(pool)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn co_visitors(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        seed_item_id: &str,
        since: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<CoVisitor>, StoreError> {
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;
        let now = ctx.now;

        with_retry(ctx, &self.options, "co_visitors", move || async move {
            sqlx::query_as::<_, CoVisitor>(CO_VISITORS_SQL)
                .bind(org_id)
                .bind(namespace)
                .bind(seed_item_id)
                .bind(since)
                .bind(now)
                .bind(limit(max))
                .fetch_all(pool)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn user_recent_items(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        since: DateTime<Utc>,
        max: usize,
        weights: &EventTypeCatalog,
    ) -> Result<Vec<RecentItem>, StoreError> {
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;
        let now = ctx.now;
        let (codes, weights) = weights.as_arrays();
        let (codes, weights) = (codes.as_slice(), weights.as_slice());

        with_retry(ctx, &self.options, "user_recent_items", move || async move {
            sqlx::query_as::<_, RecentItem>(USER_RECENT_ITEMS_SQL)
                .bind(org_id)
                .bind(namespace)
                .bind(user_id)
                .bind(since)
                .bind(now)
                .bind(codes)
                .bind(weights)
                .bind(limit(max))
                .fetch_all(pool)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn user_tag_profile(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        since: DateTime<Utc>,
        weights: &EventTypeCatalog,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;
        let now = ctx.now;
        let (codes, weights) = weights.as_arrays();
        let (codes, weights) = (codes.as_slice(), weights.as_slice());

        let rows: Vec<(String, f64)> =
            with_retry(ctx, &self.options, "user_tag_profile", move || async move {
                sqlx::query_as::<_, (String, f64)>(USER_TAG_PROFILE_SQL)
                    .bind(org_id)
                    .bind(namespace)
                    .bind(user_id)
                    .bind(since)
                    .bind(now)
                    .bind(codes)
                    .bind(weights)
                    .fetch_all(pool)
                    .await
                    .map_err(StoreError::from)
            })
            .await?;

        Ok(rows.into_iter().filter(|(_, w)| *w > 0.0).collect())
    }

    async fn items_by_ids(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        ids: &[String],
    ) -> Result<HashMap<String, Item>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;

        let rows: Vec<ItemRow> = with_retry(ctx, &self.options, "items_by_ids", move || async move {
            sqlx::query_as::<_, ItemRow>(ITEMS_BY_IDS_SQL)
                .bind(org_id)
                .bind(namespace)
                .bind(ids)
                .fetch_all(pool)
                .await
                .map_err(StoreError::from)
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.item_id.clone(), Item::from(row)))
            .collect())
    }

    async fn items_with_any_tag(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        tags: &[String],
        max: usize,
    ) -> Result<Vec<Item>, StoreError> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;
        let lowered: Vec<String> = tags.iter().map(|t| t.trim().to_lowercase()).collect();
        let lowered = lowered.as_slice();

        let rows: Vec<ItemRow> =
            with_retry(ctx, &self.options, "items_with_any_tag", move || async move {
                sqlx::query_as::<_, ItemRow>(ITEMS_WITH_ANY_TAG_SQL)
                    .bind(org_id)
                    .bind(namespace)
                    .bind(lowered)
                    .bind(limit(max))
                    .fetch_all(pool)
                    .await
                    .map_err(StoreError::from)
            })
            .await?;

        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn rules_for(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        surface: &str,
    ) -> Result<Vec<Rule>, StoreError> {
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;
        let now = ctx.now;

        let rows: Vec<RuleRow> = with_retry(ctx, &self.options, "rules_for", move || async move {
            sqlx::query_as::<_, RuleRow>(RULES_FOR_SQL)
                .bind(org_id)
                .bind(namespace)
                .bind(surface)
                .bind(now)
                .fetch_all(pool)
                .await
                .map_err(StoreError::from)
        })
        .await?;

        parse_rules(rows)
    }

    async fn recent_event_items(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        event_types: &[i16],
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        if event_types.is_empty() {
            return Ok(HashSet::new());
        }
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;
        let now = ctx.now;

        let rows: Vec<(String,)> =
            with_retry(ctx, &self.options, "recent_event_items", move || async move {
                sqlx::query_as::<_, (String,)>(RECENT_EVENT_ITEMS_SQL)
                    .bind(org_id)
                    .bind(namespace)
                    .bind(user_id)
                    .bind(event_types)
                    .bind(since)
                    .bind(now)
                    .fetch_all(pool)
                    .await
                    .map_err(StoreError::from)
            })
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn holdout_samples(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        since: DateTime<Utc>,
        min_events: usize,
        max: usize,
    ) -> Result<Vec<HoldoutSample>, StoreError> {
        let pool = &self.pool;
        let namespace = scope.namespace.as_str();
        let org_id = scope.org_id;
        let now = ctx.now;

        with_retry(ctx, &self.options, "holdout_samples", move || async move {
            sqlx::query_as::<_, HoldoutSample>(HOLDOUT_SAMPLES_SQL)
                .bind(org_id)
                .bind(namespace)
                .bind(since)
                .bind(now)
                .bind(limit(min_events))
                .bind(limit(max))
                .fetch_all(pool)
                .await
                .map_err(StoreError::from)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_row(action: &str) -> RuleRow {
        RuleRow {
            rule_id: Uuid::new_v4(),
            namespace: "default".into(),
            surface: "home".into(),
            target_type: "brand".into(),
            target_value: Some("acme".into()),
            item_ids: None,
            action: action.into(),
            boost_value: Some(0.5),
            pin_position: Some(2),
            max_pins: None,
            priority: 10,
            enabled: true,
            valid_from: None,
            valid_until: None,
        }
    }

    #[test]
    fn test_rule_row_conversion() {
        let rule = Rule::try_from(rule_row("boost")).unwrap();
        assert_eq!(rule.action, RuleAction::Boost { strength: 0.5 });
        assert_eq!(rule.target, RuleTarget::Brand("acme".into()));

        let rule = Rule::try_from(rule_row("PIN")).unwrap();
        assert_eq!(rule.action, RuleAction::Pin { position: 2 });
    }

    #[test]
    fn test_rule_row_rejects_malformed_pin() {
        let mut row = rule_row("pin");
        row.pin_position = Some(0);
        assert!(Rule::try_from(row).is_err());

        let mut row = rule_row("block");
        row.target_type = "segment".into();
        assert!(Rule::try_from(row).is_err());
    }

    #[test]
    fn test_malformed_rule_fails_the_whole_read() {
        let good = rule_row("block");
        let mut bad = rule_row("boost");
        bad.boost_value = None;
        let bad_id = bad.rule_id;

        let err = parse_rules(vec![good, bad]).unwrap_err();
        assert!(matches!(err, StoreError::Permanent(ref msg) if msg.contains(&bad_id.to_string())));
        assert!(!err.is_unavailable());

        let rules = parse_rules(vec![rule_row("block"), rule_row("pin")]).unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_rule_row_max_pins() {
        let mut row = rule_row("pin");
        row.max_pins = Some(2);
        assert_eq!(Rule::try_from(row).unwrap().max_pins, Some(2));

        let mut row = rule_row("pin");
        row.max_pins = Some(-1);
        assert!(Rule::try_from(row).is_err());
    }

    #[test]
    fn test_item_row_defaults_props() {
        let item = Item::from(ItemRow {
            item_id: "a".into(),
            available: true,
            price: Some(9.5),
            tags: vec!["x".into()],
            props: None,
            created_at: Utc::now(),
        });
        assert_eq!(item.props, serde_json::Value::Null);
        assert_eq!(item.price, Some(9.5));
    }
}
