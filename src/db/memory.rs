use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    decay_factor, CoVisitor, HoldoutSample, PopularItem, PopularityQuery, RecStore, RecentItem,
    StoreError, TenantScope,
};
use crate::context::RequestContext;
use crate::models::{Event, EventTypeCatalog, EventTypeInfo, Item, Rule, User};

/// Everything the store knows about one tenant
#[derive(Debug, Clone, Default)]
pub struct TenantSnapshot {
    pub items: Vec<Item>,
    pub users: Vec<User>,
    pub events: Vec<Event>,
    pub event_types: Vec<(i16, EventTypeInfo)>,
    pub rules: Vec<Rule>,
}

impl TenantSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }

    pub fn items(mut self, items: impl IntoIterator<Item = Item>) -> Self {
        self.items.extend(items);
        self
    }

    pub fn user(mut self, user: User) -> Self {
        self.users.push(user);
        self
    }

    pub fn event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.events.extend(events);
        self
    }

    pub fn event_type(mut self, code: i16, info: EventTypeInfo) -> Self {
        self.event_types.push((code, info));
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// `RecStore` over immutable in-process snapshots.
///
/// Mirrors the Postgres queries, including ordering and tie-breaks, so the
/// pipeline behaves the same against either store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tenants: HashMap<TenantScope, TenantSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, scope: TenantScope, snapshot: TenantSnapshot) -> Self {
        self.tenants.insert(scope, snapshot);
        self
    }

    fn tenant(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
    ) -> Result<Option<&TenantSnapshot>, StoreError> {
        if ctx.is_canceled() {
            return Err(StoreError::Canceled);
        }
        Ok(self.tenants.get(scope))
    }

    fn item_map(snapshot: &TenantSnapshot) -> HashMap<&str, &Item> {
        snapshot
            .items
            .iter()
            .map(|item| (item.item_id.as_str(), item))
            .collect()
    }
}

fn visible(event: &Event, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    event.ts >= since && event.ts <= now
}

#[async_trait]
impl RecStore for MemoryStore {
    async fn event_type_weights(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
    ) -> Result<EventTypeCatalog, StoreError> {
        let catalog = EventTypeCatalog::defaults();
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(catalog);
        };
        Ok(snapshot
            .event_types
            .iter()
            .fold(catalog, |catalog, (code, info)| {
                catalog.with_override(*code, info.clone())
            }))
    }

    async fn top_popular(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        query: &PopularityQuery,
    ) -> Result<Vec<PopularItem>, StoreError> {
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(Vec::new());
        };
        let excluded: HashSet<&str> = query.exclude_item_ids.iter().map(String::as_str).collect();

        let mut scored: BTreeMap<&str, (f64, DateTime<Utc>)> = BTreeMap::new();
        for event in snapshot.events.iter().filter(|e| visible(e, query.since, ctx.now)) {
            let weight = query.weights.weight(event.event_type);
            if weight <= 0.0 || excluded.contains(event.item_id.as_str()) {
                continue;
            }
            let contribution = weight * decay_factor(ctx.now - event.ts, query.half_life_days);
            let entry = scored
                .entry(event.item_id.as_str())
                .or_insert((0.0, event.ts));
            entry.0 += contribution;
            entry.1 = entry.1.max(event.ts);
        }

        let mut items: Vec<PopularItem> = scored
            .into_iter()
            .filter(|(_, (score, _))| *score > 0.0)
            .map(|(item_id, (score, last_ts))| PopularItem {
                item_id: item_id.to_string(),
                score,
                last_ts,
            })
            .collect();
        items.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.last_ts.cmp(&a.last_ts))
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        items.truncate(query.limit);
        Ok(items)
    }

    async fn co_visitors(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        seed_item_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CoVisitor>, StoreError> {
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(Vec::new());
        };
        let window: Vec<&Event> = snapshot
            .events
            .iter()
            .filter(|e| visible(e, since, ctx.now))
            .collect();

        let seed_users: HashSet<&str> = window
            .iter()
            .filter(|e| e.item_id == seed_item_id)
            .map(|e| e.user_id.as_str())
            .collect();

        let mut users_by_item: BTreeMap<&str, HashSet<&str>> = BTreeMap::new();
        for event in window {
            if event.item_id != seed_item_id && seed_users.contains(event.user_id.as_str()) {
                users_by_item
                    .entry(event.item_id.as_str())
                    .or_default()
                    .insert(event.user_id.as_str());
            }
        }

        let mut visitors: Vec<CoVisitor> = users_by_item
            .into_iter()
            .map(|(item_id, users)| CoVisitor {
                item_id: item_id.to_string(),
                count: users.len() as f64,
            })
            .collect();
        visitors.sort_by(|a, b| {
            b.count
                .total_cmp(&a.count)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        visitors.truncate(limit);
        Ok(visitors)
    }

    async fn user_recent_items(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
        weights: &EventTypeCatalog,
    ) -> Result<Vec<RecentItem>, StoreError> {
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(Vec::new());
        };

        let mut latest: BTreeMap<&str, (DateTime<Utc>, f64)> = BTreeMap::new();
        for event in snapshot
            .events
            .iter()
            .filter(|e| e.user_id == user_id && visible(e, since, ctx.now))
        {
            let weight = weights.weight(event.event_type);
            let entry = latest
                .entry(event.item_id.as_str())
                .or_insert((event.ts, weight));
            entry.0 = entry.0.max(event.ts);
            entry.1 = entry.1.max(weight);
        }

        let mut items: Vec<RecentItem> = latest
            .into_iter()
            .map(|(item_id, (last_ts, best_event_weight))| RecentItem {
                item_id: item_id.to_string(),
                last_ts,
                best_event_weight,
            })
            .collect();
        items.sort_by(|a, b| {
            b.last_ts
                .cmp(&a.last_ts)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        items.truncate(limit);
        Ok(items)
    }

    async fn user_tag_profile(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        since: DateTime<Utc>,
        weights: &EventTypeCatalog,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(HashMap::new());
        };
        let items = Self::item_map(snapshot);

        let mut profile: HashMap<String, f64> = HashMap::new();
        for event in snapshot
            .events
            .iter()
            .filter(|e| e.user_id == user_id && visible(e, since, ctx.now))
        {
            let weight = weights.weight(event.event_type);
            let Some(item) = items.get(event.item_id.as_str()) else {
                continue;
            };
            for tag in &item.tags {
                *profile.entry(tag.trim().to_lowercase()).or_insert(0.0) += weight;
            }
        }
        profile.retain(|_, weight| *weight > 0.0);
        Ok(profile)
    }

    async fn items_by_ids(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        ids: &[String],
    ) -> Result<HashMap<String, Item>, StoreError> {
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(HashMap::new());
        };
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(snapshot
            .items
            .iter()
            .filter(|item| wanted.contains(item.item_id.as_str()))
            .map(|item| (item.item_id.clone(), item.clone()))
            .collect())
    }

    async fn items_with_any_tag(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Item>, StoreError> {
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(Vec::new());
        };
        let wanted: HashSet<String> = tags.iter().map(|t| t.trim().to_lowercase()).collect();

        let mut items: Vec<Item> = snapshot
            .items
            .iter()
            .filter(|item| {
                item.available
                    && item
                        .tags
                        .iter()
                        .any(|t| wanted.contains(&t.trim().to_lowercase()))
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        items.truncate(limit);
        Ok(items)
    }

    async fn rules_for(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        surface: &str,
    ) -> Result<Vec<Rule>, StoreError> {
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(Vec::new());
        };
        let mut rules: Vec<Rule> = snapshot
            .rules
            .iter()
            .filter(|rule| {
                rule.namespace == scope.namespace
                    && rule.is_active(ctx.now)
                    && rule.applies_to_surface(surface)
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        Ok(rules)
    }

    async fn recent_event_items(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        event_types: &[i16],
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(HashSet::new());
        };
        Ok(snapshot
            .events
            .iter()
            .filter(|e| {
                e.user_id == user_id
                    && event_types.contains(&e.event_type)
                    && visible(e, since, ctx.now)
            })
            .map(|e| e.item_id.clone())
            .collect())
    }

    async fn holdout_samples(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        since: DateTime<Utc>,
        min_events: usize,
        limit: usize,
    ) -> Result<Vec<HoldoutSample>, StoreError> {
        let Some(snapshot) = self.tenant(ctx, scope)? else {
            return Ok(Vec::new());
        };

        let mut per_user: BTreeMap<&str, (usize, &Event)> = BTreeMap::new();
        for event in snapshot.events.iter().filter(|e| visible(e, since, ctx.now)) {
            let entry = per_user
                .entry(event.user_id.as_str())
                .or_insert((0, event));
            entry.0 += 1;
            let newer = event.ts > entry.1.ts
                || (event.ts == entry.1.ts && event.item_id < entry.1.item_id);
            if newer {
                entry.1 = event;
            }
        }

        let mut samples: Vec<HoldoutSample> = per_user
            .into_iter()
            .filter(|(_, (count, _))| *count >= min_events)
            .map(|(user_id, (count, event))| HoldoutSample {
                user_id: user_id.to_string(),
                item_id: event.item_id.clone(),
                ts: event.ts,
                event_count: count as i64,
            })
            .collect();
        samples.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| a.user_id.cmp(&b.user_id)));
        samples.truncate(limit);
        Ok(samples)
    }
}
