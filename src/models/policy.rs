use serde::Serialize;

use super::RuleActionKind;

/// Maximum number of ids kept in the summary's sample lists
pub const SUMMARY_SAMPLE_LIMIT: usize = 20;

/// What the policy filter did to one request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PolicySummary {
    pub total_candidates: usize,
    /// Candidates without a usable item record
    pub unavailable_count: usize,
    pub explicit_exclude_hits: usize,
    pub recent_event_exclude_hits: usize,
    pub after_exclusions: usize,

    pub constraint_include_tags: Vec<String>,
    pub constraint_filtered_count: usize,
    pub constraint_filtered_ids: Vec<String>,
    pub after_constraint_filters: usize,

    pub rule_block_count: usize,
    pub rule_pin_count: usize,
    pub rule_boost_count: usize,
    pub rule_block_exposure: usize,
    pub rule_pin_exposure: usize,
    pub rule_boost_exposure: usize,
    /// Pins that lifted a rule block or a recent-event exclusion
    pub pin_override_count: usize,
    pub after_rules: usize,

    pub final_count: usize,
    pub constraint_leak_count: usize,
    pub constraint_leak_ids: Vec<String>,
}

impl PolicySummary {
    pub fn rule_count(&self, kind: RuleActionKind) -> usize {
        match kind {
            RuleActionKind::Block => self.rule_block_count,
            RuleActionKind::Pin => self.rule_pin_count,
            RuleActionKind::Boost => self.rule_boost_count,
        }
    }

    pub fn rule_exposure(&self, kind: RuleActionKind) -> usize {
        match kind {
            RuleActionKind::Block => self.rule_block_exposure,
            RuleActionKind::Pin => self.rule_pin_exposure,
            RuleActionKind::Boost => self.rule_boost_exposure,
        }
    }

    /// Actions that matched items but left no trace in the final list
    pub fn zero_effect_actions(&self) -> Vec<RuleActionKind> {
        RuleActionKind::ALL
            .into_iter()
            .filter(|kind| self.rule_count(*kind) > 0 && self.rule_exposure(*kind) == 0)
            .collect()
    }

    pub(crate) fn record_filtered(&mut self, item_id: &str) {
        self.constraint_filtered_count += 1;
        if self.constraint_filtered_ids.len() < SUMMARY_SAMPLE_LIMIT {
            self.constraint_filtered_ids.push(item_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_effect_requires_matches() {
        let summary = PolicySummary {
            rule_pin_count: 1,
            rule_boost_count: 2,
            rule_boost_exposure: 1,
            ..Default::default()
        };
        assert_eq!(summary.zero_effect_actions(), vec![RuleActionKind::Pin]);
    }

    #[test]
    fn test_filtered_sample_is_bounded() {
        let mut summary = PolicySummary::default();
        for i in 0..30 {
            summary.record_filtered(&format!("item-{}", i));
        }
        assert_eq!(summary.constraint_filtered_count, 30);
        assert_eq!(summary.constraint_filtered_ids.len(), SUMMARY_SAMPLE_LIMIT);
    }
}
