use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::EngineConfig;
use crate::models::{rank_order, Candidate, Item};

/// Tag facets of one candidate, precomputed for MMR and caps
#[derive(Debug, Default)]
struct Facets {
    tags: HashSet<String>,
    brands: Vec<String>,
    categories: Vec<String>,
}

/// Jaccard similarity over lower-cased tag sets
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[derive(Debug, Default)]
struct CapCounter {
    brands: HashMap<String, usize>,
    categories: HashMap<String, usize>,
}

impl CapCounter {
    fn record(&mut self, facets: &Facets) {
        for brand in &facets.brands {
            *self.brands.entry(brand.clone()).or_default() += 1;
        }
        for category in &facets.categories {
            *self.categories.entry(category.clone()).or_default() += 1;
        }
    }

    fn violates(&self, facets: &Facets, brand_cap: usize, category_cap: usize) -> bool {
        let over = |counts: &HashMap<String, usize>, values: &[String], cap: usize| {
            cap > 0
                && values
                    .iter()
                    .any(|v| counts.get(v).copied().unwrap_or(0) >= cap)
        };
        over(&self.brands, &facets.brands, brand_cap)
            || over(&self.categories, &facets.categories, category_cap)
    }
}

/// MMR re-ranker with brand/category caps and pinned slots
#[derive(Debug, Clone)]
pub struct Diversifier {
    lambda: f64,
    brand_cap: usize,
    category_cap: usize,
    brand_prefixes: Vec<String>,
    category_prefixes: Vec<String>,
}

impl Diversifier {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            lambda: config.mmr_lambda,
            brand_cap: config.brand_cap,
            category_cap: config.category_cap,
            brand_prefixes: config.brand_tag_prefixes.clone(),
            category_prefixes: config.category_tag_prefixes.clone(),
        }
    }

    fn facets(&self, item: Option<&Item>) -> Facets {
        let Some(item) = item else {
            return Facets::default();
        };
        Facets {
            tags: item.tags.iter().map(|t| t.trim().to_lowercase()).collect(),
            brands: item.prefixed_values(&self.brand_prefixes),
            categories: item.prefixed_values(&self.category_prefixes),
        }
    }

    /// Produces at most `k` items: pins at their slots, MMR picks around them.
    ///
    /// Pins are ordered by position, then rule priority desc, then score desc;
    /// a pin that loses a slot takes the next free one. Pins count toward the
    /// caps but are never removed by them.
    pub fn rerank(
        &self,
        candidates: Vec<Candidate>,
        items: &HashMap<String, Item>,
        k: usize,
    ) -> Vec<Candidate> {
        if k == 0 || candidates.is_empty() {
            return Vec::new();
        }

        let (mut pinned, mut unpinned): (Vec<Candidate>, Vec<Candidate>) =
            candidates.into_iter().partition(|c| c.pin.is_some());
        pinned.sort_by(|a, b| {
            let (pa, pb) = (a.pin.map_or(0, |p| p.position), b.pin.map_or(0, |p| p.position));
            let (ra, rb) = (a.pin.map_or(0, |p| p.priority), b.pin.map_or(0, |p| p.priority));
            pa.cmp(&pb)
                .then_with(|| rb.cmp(&ra))
                .then_with(|| rank_order(a, b))
        });
        unpinned.sort_by(rank_order);

        let mut slots: BTreeMap<usize, Candidate> = BTreeMap::new();
        for candidate in pinned {
            let mut slot = candidate.pin.map_or(1, |p| p.position).max(1) - 1;
            while slots.contains_key(&slot) {
                slot += 1;
            }
            slots.insert(slot, candidate);
        }

        let max_score = unpinned
            .iter()
            .map(|c| c.combined)
            .fold(0.0_f64, f64::max);
        let mut remaining: Vec<(Candidate, Facets)> = unpinned
            .into_iter()
            .map(|c| {
                let facets = self.facets(items.get(&c.item_id));
                (c, facets)
            })
            .collect();

        let mut selected: Vec<(Candidate, Facets)> = Vec::with_capacity(k);
        let mut caps = CapCounter::default();

        while selected.len() < k {
            if let Some(pin) = slots.remove(&selected.len()) {
                let facets = self.facets(items.get(&pin.item_id));
                caps.record(&facets);
                selected.push((pin, facets));
                continue;
            }

            remaining.retain(|(_, facets)| {
                !caps.violates(facets, self.brand_cap, self.category_cap)
            });
            if let Some(idx) = self.best_pick(&remaining, &selected, max_score) {
                let (candidate, facets) = remaining.remove(idx);
                caps.record(&facets);
                selected.push((candidate, facets));
                continue;
            }

            // Unpinned pool exhausted: later pins move up.
            match slots.pop_first() {
                Some((_, pin)) => {
                    let facets = self.facets(items.get(&pin.item_id));
                    caps.record(&facets);
                    selected.push((pin, facets));
                }
                None => break,
            }
        }

        selected.into_iter().map(|(candidate, _)| candidate).collect()
    }

    /// Index of the highest MMR score; ties keep the earlier candidate.
    fn best_pick(
        &self,
        remaining: &[(Candidate, Facets)],
        selected: &[(Candidate, Facets)],
        max_score: f64,
    ) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, (candidate, facets)) in remaining.iter().enumerate() {
            let relevance = if max_score > 0.0 {
                candidate.combined / max_score
            } else {
                0.0
            };
            let redundancy = selected
                .iter()
                .map(|(_, chosen)| jaccard(&facets.tags, &chosen.tags))
                .fold(0.0_f64, f64::max);
            let mmr = self.lambda * relevance - (1.0 - self.lambda) * redundancy;
            if best.map_or(true, |(_, score)| mmr > score) {
                best = Some((idx, mmr));
            }
        }
        best.map(|(idx, _)| idx)
    }
}
