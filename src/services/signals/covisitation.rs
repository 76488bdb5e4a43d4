use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;

use super::{top_scored, CandidateSet, SignalGenerator, SignalInput};
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::db::{decay_factor, days, RecStore, StoreError};
use crate::models::SignalKind;

/// Items co-occurring with the user's recent items (or explicit seeds)
pub struct CoVisitationGenerator {
    config: Arc<EngineConfig>,
}

impl CoVisitationGenerator {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// `(seed, weight)` pairs, most recent first
    async fn seeds(
        &self,
        ctx: &RequestContext,
        input: &SignalInput<'_>,
        store: &dyn RecStore,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        if let Some(seeds) = input.seeds {
            return Ok(seeds.iter().map(|s| (s.clone(), 1.0)).collect());
        }
        let Some(user_id) = input.user_id else {
            return Ok(Vec::new());
        };

        let recent = store
            .user_recent_items(
                ctx,
                input.scope,
                user_id,
                ctx.now - days(self.config.covis_window_days),
                self.config.covis_max_seeds,
                input.event_weights,
            )
            .await?;

        Ok(recent
            .into_iter()
            .map(|item| {
                let recency = decay_factor(ctx.now - item.last_ts, self.config.half_life_days);
                (item.item_id, item.best_event_weight * recency)
            })
            .filter(|(_, weight)| *weight > 0.0)
            .collect())
    }
}

#[async_trait]
impl SignalGenerator for CoVisitationGenerator {
    fn kind(&self) -> SignalKind {
        SignalKind::CoVisitation
    }

    async fn generate(
        &self,
        ctx: &RequestContext,
        input: &SignalInput<'_>,
        store: &dyn RecStore,
    ) -> Result<CandidateSet, StoreError> {
        let seeds = self.seeds(ctx, input, store).await?;
        if seeds.is_empty() {
            return Ok(CandidateSet::empty(self.kind()));
        }

        let since = ctx.now - days(self.config.covis_window_days);
        let neighbors = try_join_all(seeds.iter().map(|(seed, _)| {
            store.co_visitors(ctx, input.scope, seed, since, self.config.cooc_fanout)
        }))
        .await?;

        let seed_ids: HashSet<&str> = seeds.iter().map(|(seed, _)| seed.as_str()).collect();
        // item -> (score, best contribution, best seed)
        let mut aggregated: BTreeMap<String, (f64, f64, String)> = BTreeMap::new();
        for ((seed, weight), visitors) in seeds.iter().zip(neighbors) {
            let max = visitors.iter().map(|v| v.count).fold(0.0_f64, f64::max);
            if max <= 0.0 {
                continue;
            }
            for visitor in visitors {
                if seed_ids.contains(visitor.item_id.as_str()) {
                    continue;
                }
                let contribution = weight * (visitor.count / max);
                let entry = aggregated
                    .entry(visitor.item_id)
                    .or_insert((0.0, 0.0, seed.clone()));
                entry.0 += contribution;
                if contribution > entry.1 {
                    entry.1 = contribution;
                    entry.2 = seed.clone();
                }
            }
        }

        let scored: Vec<(String, f64, String)> = aggregated
            .into_iter()
            .map(|(item_id, (score, _, seed))| (item_id, score, seed))
            .collect();
        let top = top_scored(scored, self.config.cooc_fanout);
        tracing::debug!(seeds = seeds.len(), count = top.len(), "Co-visitation candidates");

        Ok(CandidateSet::from_raw(
            self.kind(),
            top.into_iter()
                .map(|(item_id, score, seed)| (item_id, score, Some(seed))),
        ))
    }
}
