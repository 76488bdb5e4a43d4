//! Candidate producers feeding the blender.
//!
//! Each generator reads from the store, scores items independently of the
//! others, and hands back a max-normalized [`CandidateSet`]. New signals plug
//! in by implementing [`SignalGenerator`]; the blender only sees the set.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::context::RequestContext;
use crate::db::{RecStore, StoreError, TenantScope};
use crate::models::{EventTypeCatalog, SignalKind};

mod covisitation;
mod popularity;
mod profile;

pub use covisitation::CoVisitationGenerator;
pub use popularity::PopularityGenerator;
pub use profile::{ProfileGenerator, TagProfile};

/// Request data visible to generators
#[derive(Debug, Clone, Copy)]
pub struct SignalInput<'a> {
    pub scope: &'a TenantScope,
    /// Absent for item-to-item requests
    pub user_id: Option<&'a str>,
    /// Explicit co-visitation seeds; replaces the user's history when set
    pub seeds: Option<&'a [String]>,
    /// Items the popularity read should skip outright
    pub exclude_item_ids: &'a [String],
    pub event_weights: &'a EventTypeCatalog,
}

#[async_trait]
pub trait SignalGenerator: Send + Sync {
    fn kind(&self) -> SignalKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    async fn generate(
        &self,
        ctx: &RequestContext,
        input: &SignalInput<'_>,
        store: &dyn RecStore,
    ) -> Result<CandidateSet, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalEntry {
    /// Score divided by the set's max, in (0, 1]
    pub score: f64,
    pub raw: f64,
    /// Strongest contributor (seed item or tag), when the signal has one
    pub detail: Option<String>,
    /// Latest contributing event, for signals that track one
    pub last_ts: Option<DateTime<Utc>>,
}

/// One generator's output, keyed by item id
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSet {
    pub kind: SignalKind,
    entries: BTreeMap<String, SignalEntry>,
    profile: Option<TagProfile>,
}

impl CandidateSet {
    pub fn empty(kind: SignalKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
            profile: None,
        }
    }

    /// Drops non-positive scores and normalizes the rest by their max.
    pub fn from_raw<I>(kind: SignalKind, scores: I) -> Self
    where
        I: IntoIterator<Item = (String, f64, Option<String>)>,
    {
        let mut raw: BTreeMap<String, (f64, Option<String>)> = BTreeMap::new();
        for (item_id, score, detail) in scores {
            if !(score.is_finite() && score > 0.0) {
                continue;
            }
            let entry = raw.entry(item_id).or_insert((0.0, None));
            entry.0 += score;
            if entry.1.is_none() {
                entry.1 = detail;
            }
        }

        let max = raw.values().map(|(score, _)| *score).fold(0.0_f64, f64::max);
        if max <= 0.0 {
            return Self::empty(kind);
        }

        let entries = raw
            .into_iter()
            .map(|(item_id, (score, detail))| {
                (
                    item_id,
                    SignalEntry {
                        score: score / max,
                        raw: score,
                        detail,
                        last_ts: None,
                    },
                )
            })
            .collect();
        Self {
            kind,
            entries,
            profile: None,
        }
    }

    /// Records the latest event time per item; unknown ids are ignored.
    pub fn with_recency<I>(mut self, recency: I) -> Self
    where
        I: IntoIterator<Item = (String, DateTime<Utc>)>,
    {
        for (item_id, ts) in recency {
            if let Some(entry) = self.entries.get_mut(&item_id) {
                entry.last_ts = entry.last_ts.max(Some(ts));
            }
        }
        self
    }

    /// Keeps the profile that produced this set so it can rescore other items
    pub fn with_profile(mut self, profile: TagProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn tag_profile(&self) -> Option<&TagProfile> {
        self.profile.as_ref()
    }

    pub fn get(&self, item_id: &str) -> Option<&SignalEntry> {
        self.entries.get(item_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SignalEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sorts `(id, score)` pairs best first with id tie-break, then keeps `limit`.
pub(crate) fn top_scored<T>(
    mut scored: Vec<(String, f64, T)>,
    limit: usize,
) -> Vec<(String, f64, T)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_normalizes_by_max() {
        let set = CandidateSet::from_raw(
            SignalKind::Popularity,
            vec![
                ("a".to_string(), 4.0, None),
                ("b".to_string(), 2.0, None),
                ("c".to_string(), 0.0, None),
                ("d".to_string(), f64::NAN, None),
            ],
        );
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("a").unwrap().score, 1.0);
        assert_eq!(set.get("b").unwrap().score, 0.5);
        assert_eq!(set.get("b").unwrap().raw, 2.0);
        assert!(set.get("c").is_none());
    }

    #[test]
    fn test_from_raw_all_zero_is_empty() {
        let set = CandidateSet::from_raw(
            SignalKind::Profile,
            vec![("a".to_string(), 0.0, Some("x".to_string()))],
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_recency_keeps_latest_for_known_items() {
        let now = Utc::now();
        let set = CandidateSet::from_raw(
            SignalKind::Popularity,
            vec![("a".to_string(), 1.0, None)],
        )
        .with_recency(vec![
            ("a".to_string(), now - chrono::Duration::hours(2)),
            ("a".to_string(), now),
            ("ghost".to_string(), now),
        ]);
        assert_eq!(set.get("a").unwrap().last_ts, Some(now));
        assert!(set.get("ghost").is_none());
    }

    #[test]
    fn test_top_scored_breaks_ties_by_id() {
        let scored = vec![
            ("b".to_string(), 1.0, ()),
            ("a".to_string(), 1.0, ()),
            ("c".to_string(), 3.0, ()),
        ];
        let top: Vec<_> = top_scored(scored, 2).into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(top, vec!["c", "a"]);
    }
}
