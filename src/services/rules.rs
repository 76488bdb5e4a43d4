use std::collections::{HashMap, HashSet};

use crate::models::{Item, Pin, Rule, RuleAction};

/// Aggregate effect of a rule list over a candidate pool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleEffects {
    pub blocked: HashSet<String>,
    /// Pins that were granted a slot. First pin wins; rules arrive highest
    /// priority first.
    pub pins: HashMap<String, Pin>,
    /// Every item a pin rule matched, granted or not
    pub pin_matches: HashSet<String>,
    /// Compounded `(1 + strength)` multipliers
    pub boosts: HashMap<String, f64>,
}

impl RuleEffects {
    pub fn is_blocked(&self, item_id: &str) -> bool {
        self.blocked.contains(item_id)
    }

    pub fn pin(&self, item_id: &str) -> Option<Pin> {
        self.pins.get(item_id).copied()
    }

    pub fn boost(&self, item_id: &str) -> Option<f64> {
        self.boosts.get(item_id).copied()
    }
}

/// Matches rules against items using the configured brand/category prefixes
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    brand_prefixes: Vec<String>,
    category_prefixes: Vec<String>,
    max_pin_slots: usize,
}

impl RuleEvaluator {
    pub fn new(brand_prefixes: Vec<String>, category_prefixes: Vec<String>) -> Self {
        Self {
            brand_prefixes,
            category_prefixes,
            max_pin_slots: usize::MAX,
        }
    }

    /// Limits how many distinct items one evaluation may pin
    pub fn with_max_pin_slots(mut self, max_pin_slots: usize) -> Self {
        self.max_pin_slots = max_pin_slots;
        self
    }

    pub fn matches(&self, rule: &Rule, item: &Item) -> bool {
        rule.target
            .matches(item, &self.brand_prefixes, &self.category_prefixes)
    }

    /// Applies rules in priority order (ties by rule id) to every item in `pool`.
    ///
    /// Pool entries flagged `false` cannot take a pin slot. They still count
    /// as pin matches. Slots go out in rule order, then pool order, until the
    /// global budget or the rule's own `max_pins` runs out.
    pub fn evaluate<'a, I>(&self, rules: &[Rule], pool: I) -> RuleEffects
    where
        I: IntoIterator<Item = (&'a Item, bool)> + Clone,
    {
        let mut ordered: Vec<&Rule> = rules.iter().collect();
        ordered.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });

        let mut effects = RuleEffects::default();
        let mut slots_left = self.max_pin_slots;
        for rule in ordered {
            let mut rule_slots_left = rule.max_pins.unwrap_or(usize::MAX);
            for (item, pinnable) in pool.clone() {
                if !self.matches(rule, item) {
                    continue;
                }
                match rule.action {
                    RuleAction::Block => {
                        effects.blocked.insert(item.item_id.clone());
                    }
                    RuleAction::Pin { position } => {
                        effects.pin_matches.insert(item.item_id.clone());
                        if !pinnable
                            || effects.pins.contains_key(&item.item_id)
                            || slots_left == 0
                            || rule_slots_left == 0
                        {
                            continue;
                        }
                        effects.pins.insert(
                            item.item_id.clone(),
                            Pin {
                                position: position.max(1),
                                priority: rule.priority,
                            },
                        );
                        slots_left -= 1;
                        rule_slots_left -= 1;
                    }
                    RuleAction::Boost { strength } => {
                        *effects.boosts.entry(item.item_id.clone()).or_insert(1.0) *=
                            1.0 + strength;
                    }
                }
            }
        }
        effects
    }
}
