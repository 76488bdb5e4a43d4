use std::sync::Arc;

use async_trait::async_trait;

use super::{CandidateSet, SignalGenerator, SignalInput};
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::db::{days, PopularityQuery, RecStore, StoreError};
use crate::models::SignalKind;

/// Time-decayed, event-weighted interaction mass per item
pub struct PopularityGenerator {
    config: Arc<EngineConfig>,
}

impl PopularityGenerator {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SignalGenerator for PopularityGenerator {
    fn kind(&self) -> SignalKind {
        SignalKind::Popularity
    }

    async fn generate(
        &self,
        ctx: &RequestContext,
        input: &SignalInput<'_>,
        store: &dyn RecStore,
    ) -> Result<CandidateSet, StoreError> {
        let query = PopularityQuery {
            since: ctx.now - days(self.config.popularity_window_days),
            half_life_days: self.config.half_life_days,
            limit: self.config.popularity_fanout,
            exclude_item_ids: input.exclude_item_ids.to_vec(),
            weights: input.event_weights.clone(),
        };

        let popular = store.top_popular(ctx, input.scope, &query).await?;
        tracing::debug!(count = popular.len(), "Popularity candidates");

        let recency: Vec<_> = popular
            .iter()
            .map(|p| (p.item_id.clone(), p.last_ts))
            .collect();
        Ok(CandidateSet::from_raw(
            self.kind(),
            popular.into_iter().map(|p| (p.item_id, p.score, None)),
        )
        .with_recency(recency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::TenantSnapshot;
    use crate::db::{MemoryStore, TenantScope};
    use crate::models::{Event, EventTypeCatalog, Item, EVENT_VIEW};
    use chrono::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_decayed_popularity_is_normalized() {
        let ctx = RequestContext::new(Uuid::new_v4());
        let scope = TenantScope::new(ctx.org_id, "default");
        let now = ctx.now;
        let store = MemoryStore::new().with_tenant(
            scope.clone(),
            TenantSnapshot::new()
                .items([Item::new("fresh"), Item::new("stale"), Item::new("skip")])
                .events([
                    Event::new("u1", "fresh", EVENT_VIEW, now - Duration::hours(1)),
                    Event::new("u1", "stale", EVENT_VIEW, now - Duration::days(14)),
                    Event::new("u1", "skip", EVENT_VIEW, now - Duration::hours(1)),
                ]),
        );
        let config = Arc::new(EngineConfig {
            half_life_days: 7.0,
            ..Default::default()
        });
        let weights = EventTypeCatalog::defaults();
        let exclude = vec!["skip".to_string()];
        let input = SignalInput {
            scope: &scope,
            user_id: None,
            seeds: None,
            exclude_item_ids: &exclude,
            event_weights: &weights,
        };

        let set = PopularityGenerator::new(config)
            .generate(&ctx, &input, &store)
            .await
            .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("fresh").unwrap().score, 1.0);
        let stale = set.get("stale").unwrap().score;
        assert!(stale > 0.24 && stale < 0.26, "two half-lives ~ 0.25, got {}", stale);
        assert!(set.get("skip").is_none());
        assert_eq!(
            set.get("fresh").unwrap().last_ts,
            Some(now - Duration::hours(1))
        );
    }
}
