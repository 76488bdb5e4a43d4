//! Layered policy filter: explicit excludes, recent-event excludes, request
//! constraints, tenant rules, then a leak self-check.

use std::collections::{HashMap, HashSet};

use tracing::error;

use crate::models::{rank_order, Candidate, Constraints, Item, PolicySummary, Rule};
use crate::services::rules::{RuleEffects, RuleEvaluator};

/// Why a candidate was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Unavailable,
    ExplicitExclude,
    RecentEvent,
    Constraint,
    RuleBlock,
}

pub struct PolicyInput<'a> {
    pub constraints: Option<&'a Constraints>,
    pub recent_excludes: &'a HashSet<String>,
    pub rules: &'a [Rule],
    pub items: &'a HashMap<String, Item>,
}

#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    /// Survivors sorted score-desc, with pins and boosts applied
    pub survivors: Vec<Candidate>,
    pub summary: PolicySummary,
    forbidden: HashMap<String, DropReason>,
    effects: RuleEffects,
}

impl PolicyOutcome {
    pub fn drop_reason(&self, item_id: &str) -> Option<DropReason> {
        self.forbidden.get(item_id).copied()
    }

    /// Ids in `returned` that some stage removed
    pub fn find_leaks<'a>(&self, returned: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        returned
            .into_iter()
            .filter(|id| self.forbidden.contains_key(*id))
            .map(str::to_string)
            .collect()
    }

    /// Fills exposure counters and the final count from the returned list.
    pub fn record_exposure(&mut self, returned: &[Candidate]) {
        let summary = &mut self.summary;
        summary.final_count = returned.len();
        summary.rule_block_exposure = returned
            .iter()
            .filter(|c| self.effects.is_blocked(&c.item_id))
            .count();
        summary.rule_pin_exposure = returned.iter().filter(|c| c.pin.is_some()).count();
        summary.rule_boost_exposure = returned.iter().filter(|c| c.boosted).count();
    }

    /// Records leaked ids on the summary; returns true when any were found.
    pub fn record_leaks(&mut self, leaked: &[String]) -> bool {
        if leaked.is_empty() {
            return false;
        }
        self.summary.constraint_leak_count += leaked.len();
        self.summary
            .constraint_leak_ids
            .extend(leaked.iter().cloned());
        true
    }
}

/// Constraint predicate with normalized include tags
struct ConstraintCheck<'a> {
    include_tags: HashSet<String>,
    constraints: Option<&'a Constraints>,
}

impl<'a> ConstraintCheck<'a> {
    fn new(constraints: Option<&'a Constraints>) -> Self {
        let include_tags = constraints
            .map(|c| {
                c.include_tags_any
                    .iter()
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            include_tags,
            constraints,
        }
    }

    fn allows(&self, item: &Item) -> bool {
        if !self.include_tags.is_empty()
            && !item
                .tags
                .iter()
                .any(|t| self.include_tags.contains(&t.trim().to_lowercase()))
        {
            return false;
        }
        let Some(constraints) = self.constraints else {
            return true;
        };
        if let Some([min, max]) = constraints.price_between {
            match item.price {
                Some(price) if price >= min && price <= max => {}
                _ => return false,
            }
        }
        if let Some(after) = constraints.created_after {
            if item.created_at <= after {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct PolicyFilter {
    evaluator: RuleEvaluator,
}

impl PolicyFilter {
    pub fn new(evaluator: RuleEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn apply(&self, candidates: Vec<Candidate>, input: &PolicyInput<'_>) -> PolicyOutcome {
        let mut summary = PolicySummary {
            total_candidates: candidates.len(),
            ..Default::default()
        };
        let mut forbidden: HashMap<String, DropReason> = HashMap::new();

        let explicit: HashSet<&str> = input
            .constraints
            .map(|c| c.exclude_item_ids.iter().map(|id| id.trim()).collect())
            .unwrap_or_default();
        let check = ConstraintCheck::new(input.constraints);
        let mut include_tags: Vec<String> = check.include_tags.iter().cloned().collect();
        include_tags.sort();
        summary.constraint_include_tags = include_tags;

        // Stages 1-3 mark candidates; rules below may still lift some marks.
        let mut staged: Vec<(Candidate, &Item, Option<DropReason>)> =
            Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(item) = input
                .items
                .get(&candidate.item_id)
                .filter(|item| item.available)
            else {
                summary.unavailable_count += 1;
                forbidden.insert(candidate.item_id.clone(), DropReason::Unavailable);
                continue;
            };

            let reason = if explicit.contains(candidate.item_id.as_str()) {
                summary.explicit_exclude_hits += 1;
                Some(DropReason::ExplicitExclude)
            } else if input.recent_excludes.contains(&candidate.item_id) {
                summary.recent_event_exclude_hits += 1;
                Some(DropReason::RecentEvent)
            } else {
                None
            };
            staged.push((candidate, item, reason));
        }
        summary.after_exclusions = staged.iter().filter(|(_, _, r)| r.is_none()).count();

        for (candidate, item, reason) in staged.iter_mut() {
            if reason.is_none() && !check.allows(item) {
                summary.record_filtered(&candidate.item_id);
                *reason = Some(DropReason::Constraint);
            }
        }
        summary.after_constraint_filters =
            staged.iter().filter(|(_, _, r)| r.is_none()).count();

        // Explicit and constraint drops are final, so they cannot hold a pin slot.
        let pool = staged.iter().map(|(_, item, reason)| {
            let pinnable = matches!(reason, None | Some(DropReason::RecentEvent));
            (*item, pinnable)
        });
        let effects = self.evaluator.evaluate(input.rules, pool);
        summary.rule_block_count = effects.blocked.len();
        summary.rule_pin_count = effects.pin_matches.len();
        summary.rule_boost_count = effects.boosts.len();

        let mut survivors = Vec::with_capacity(staged.len());
        for (mut candidate, _, reason) in staged {
            let pin = effects.pin(&candidate.item_id);
            let blocked = effects.is_blocked(&candidate.item_id);

            let verdict = match (reason, pin) {
                (Some(DropReason::RecentEvent), Some(_)) => {
                    summary.pin_override_count += 1;
                    None
                }
                (Some(reason), _) => Some(reason),
                (None, None) if blocked => Some(DropReason::RuleBlock),
                (None, Some(_)) if blocked => {
                    summary.pin_override_count += 1;
                    None
                }
                (None, _) => None,
            };

            if let Some(reason) = verdict {
                forbidden.insert(candidate.item_id.clone(), reason);
                continue;
            }
            if candidate.pin_only && pin.is_none() {
                continue;
            }

            candidate.pin = pin;
            if let Some(multiplier) = effects.boost(&candidate.item_id) {
                candidate.combined *= multiplier;
                candidate.boosted = true;
            }
            survivors.push(candidate);
        }
        survivors.sort_by(rank_order);
        summary.after_rules = survivors.len();

        let mut outcome = PolicyOutcome {
            survivors,
            summary,
            forbidden,
            effects,
        };

        let leaked = outcome.find_leaks(outcome.survivors.iter().map(|c| c.item_id.as_str()));
        if outcome.record_leaks(&leaked) {
            error!(leaked = ?leaked, "Policy filter left removed items in the survivor set");
        }
        outcome
    }
}
