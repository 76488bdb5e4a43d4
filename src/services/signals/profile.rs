use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use super::{top_scored, CandidateSet, SignalGenerator, SignalInput};
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::db::{days, RecStore, StoreError};
use crate::models::{Item, SignalKind};

/// Tag affinity between the user's history and candidate items
pub struct ProfileGenerator {
    config: Arc<EngineConfig>,
}

impl ProfileGenerator {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Scales the profile boost down for users with too little history
    async fn attenuation(
        &self,
        ctx: &RequestContext,
        input: &SignalInput<'_>,
        user_id: &str,
        store: &dyn RecStore,
    ) -> Result<f64, StoreError> {
        let min_events = self.config.profile_min_events_for_boost;
        if min_events == 0 {
            return Ok(1.0);
        }
        let recent = store
            .user_recent_items(
                ctx,
                input.scope,
                user_id,
                ctx.now - days(self.config.profile_window_days),
                min_events,
                input.event_weights,
            )
            .await?;
        if recent.len() >= min_events {
            Ok(1.0)
        } else {
            Ok(self.config.profile_cold_start_multiplier.clamp(0.0, 1.0))
        }
    }
}

/// A user's heaviest tags and how strongly their boost applies
#[derive(Debug, Clone, PartialEq)]
pub struct TagProfile {
    weights: BTreeMap<String, f64>,
    /// 1.0 for established users, lower during cold start
    pub attenuation: f64,
}

impl TagProfile {
    pub fn new<I>(tags: I, attenuation: f64) -> Self
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        Self {
            weights: tags
                .into_iter()
                .map(|(tag, weight)| (tag.trim().to_lowercase(), weight))
                .collect(),
            attenuation,
        }
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.weights.keys().cloned().collect()
    }

    /// Summed weight of the item's profile tags plus the heaviest of them
    pub fn overlap(&self, item: &Item) -> Option<(f64, String)> {
        let item_tags: BTreeSet<String> =
            item.tags.iter().map(|t| t.trim().to_lowercase()).collect();
        let mut score = 0.0_f64;
        let mut best: Option<(&str, f64)> = None;
        for tag in &item_tags {
            if let Some((name, weight)) = self.weights.get_key_value(tag.as_str()) {
                score += weight;
                if best.map_or(true, |(_, w)| *weight > w) {
                    best = Some((name.as_str(), *weight));
                }
            }
        }
        best.map(|(name, _)| (score, name.to_string()))
    }

    /// Profile signal over an arbitrary item pool, keeping this profile attached
    pub fn score_items<'a, I>(&self, items: I) -> CandidateSet
    where
        I: IntoIterator<Item = &'a Item>,
    {
        let scored = items.into_iter().filter_map(|item| {
            self.overlap(item)
                .map(|(score, tag)| (item.item_id.clone(), score, Some(tag)))
        });
        CandidateSet::from_raw(SignalKind::Profile, scored).with_profile(self.clone())
    }
}

/// Heaviest `n` tags, ties by tag name
fn top_tags(profile: HashMap<String, f64>, n: usize) -> Vec<(String, f64)> {
    let mut tags: Vec<(String, f64)> = profile.into_iter().collect();
    tags.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    tags.truncate(n);
    tags
}

#[async_trait]
impl SignalGenerator for ProfileGenerator {
    fn kind(&self) -> SignalKind {
        SignalKind::Profile
    }

    async fn generate(
        &self,
        ctx: &RequestContext,
        input: &SignalInput<'_>,
        store: &dyn RecStore,
    ) -> Result<CandidateSet, StoreError> {
        let Some(user_id) = input.user_id else {
            return Ok(CandidateSet::empty(self.kind()));
        };

        let history = store
            .user_tag_profile(
                ctx,
                input.scope,
                user_id,
                ctx.now - days(self.config.profile_window_days),
                input.event_weights,
            )
            .await?;
        let tags = top_tags(history, self.config.profile_top_n_tags);
        if tags.is_empty() {
            return Ok(CandidateSet::empty(self.kind()));
        }

        let attenuation = self.attenuation(ctx, input, user_id, store).await?;
        let profile = TagProfile::new(tags, attenuation);
        let pool = store
            .items_with_any_tag(ctx, input.scope, &profile.tag_names(), self.config.profile_fanout)
            .await?;

        let scored: Vec<(String, f64, String)> = pool
            .iter()
            .filter_map(|item| {
                profile
                    .overlap(item)
                    .map(|(score, tag)| (item.item_id.clone(), score, tag))
            })
            .collect();
        let top = top_scored(scored, self.config.profile_fanout);
        tracing::debug!(
            tags = profile.weights.len(),
            count = top.len(),
            attenuation,
            "Profile candidates"
        );

        Ok(CandidateSet::from_raw(
            self.kind(),
            top.into_iter()
                .map(|(item_id, score, tag)| (item_id, score, Some(tag))),
        )
        .with_profile(profile))
    }
}
