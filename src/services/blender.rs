use std::collections::BTreeSet;

use crate::error::{AppError, AppResult};
use crate::models::{rank_order, BlendWeights, Candidate, SignalKind};
use crate::services::signals::CandidateSet;

/// Fuses per-signal candidate sets into one ranked list
#[derive(Debug, Clone)]
pub struct Blender {
    defaults: BlendWeights,
    profile_boost: f64,
}

impl Blender {
    pub fn new(defaults: BlendWeights, profile_boost: f64) -> Self {
        Self {
            defaults,
            profile_boost,
        }
    }

    /// The request override if present, else the configured defaults.
    pub fn resolve_weights(&self, requested: Option<&BlendWeights>) -> AppResult<BlendWeights> {
        let weights = requested.copied().unwrap_or(self.defaults);
        weights.validate().map_err(AppError::InvalidBlend)?;
        Ok(weights)
    }

    /// Whether the profile signal contributes at all under `weights`
    pub fn uses_profile(&self, weights: &BlendWeights) -> bool {
        weights.gamma > 0.0 || self.profile_boost > 0.0
    }

    /// `combined = α·P + β·C + γ·F`, then the profile multiplier.
    ///
    /// The multiplier is `1 + boost·F·a`, where `a` is the profile's
    /// cold-start attenuation. Items whose combined score is zero carry no
    /// supporting signal and are dropped. Output follows [`rank_order`].
    pub fn blend(&self, weights: &BlendWeights, sets: &[CandidateSet]) -> Vec<Candidate> {
        let find = |kind: SignalKind| sets.iter().find(|set| set.kind == kind);
        let pop = find(SignalKind::Popularity);
        let cooc = find(SignalKind::CoVisitation);
        let profile = find(SignalKind::Profile);
        let attenuation = profile
            .and_then(|set| set.tag_profile())
            .map_or(1.0, |p| p.attenuation);

        let ids: BTreeSet<&String> = sets
            .iter()
            .flat_map(|set| set.iter().map(|(id, _)| id))
            .collect();

        let mut candidates: Vec<Candidate> = ids
            .into_iter()
            .filter_map(|item_id| {
                let pop_entry = pop.and_then(|set| set.get(item_id));
                let cooc_entry = cooc.and_then(|set| set.get(item_id));
                let profile_entry = profile.and_then(|set| set.get(item_id));

                let mut candidate = Candidate::new(item_id.clone(), 0.0);
                candidate.pop = pop_entry.map_or(0.0, |e| e.score);
                candidate.cooc = cooc_entry.map_or(0.0, |e| e.score);
                candidate.profile = profile_entry.map_or(0.0, |e| e.score);

                candidate.combined = weights.alpha * candidate.pop
                    + weights.beta * candidate.cooc
                    + weights.gamma * candidate.profile;
                if !(candidate.combined > 0.0) {
                    return None;
                }

                for (kind, score) in [
                    (SignalKind::Popularity, candidate.pop),
                    (SignalKind::CoVisitation, candidate.cooc),
                    (SignalKind::Profile, candidate.profile),
                ] {
                    if weights.weight(kind) > 0.0 && score > 0.0 {
                        candidate.provenance.push(kind);
                    }
                }

                if self.profile_boost > 0.0 && candidate.profile > 0.0 {
                    candidate.combined *=
                        1.0 + self.profile_boost * candidate.profile * attenuation;
                    if !candidate.has_signal(SignalKind::Profile) {
                        candidate.provenance.push(SignalKind::Profile);
                    }
                }

                candidate.last_ts = [pop_entry, cooc_entry, profile_entry]
                    .into_iter()
                    .flatten()
                    .filter_map(|e| e.last_ts)
                    .max();

                if candidate.has_signal(SignalKind::CoVisitation) {
                    candidate.seed = cooc_entry.and_then(|e| e.detail.clone());
                }
                if candidate.has_signal(SignalKind::Profile) {
                    candidate.top_tag = profile_entry.and_then(|e| e.detail.clone());
                }
                Some(candidate)
            })
            .collect();

        candidates.sort_by(rank_order);
        candidates
    }
}
