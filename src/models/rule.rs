use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Item;

/// What a rule does to the items it matches
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RuleAction {
    Block,
    /// 1-based position in the final list
    Pin { position: usize },
    /// Multiplies the combined score by `1 + strength`
    Boost { strength: f64 },
}

impl RuleAction {
    pub fn kind(&self) -> RuleActionKind {
        match self {
            RuleAction::Block => RuleActionKind::Block,
            RuleAction::Pin { .. } => RuleActionKind::Pin,
            RuleAction::Boost { .. } => RuleActionKind::Boost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleActionKind {
    Block,
    Pin,
    Boost,
}

impl RuleActionKind {
    pub const ALL: [RuleActionKind; 3] = [
        RuleActionKind::Block,
        RuleActionKind::Pin,
        RuleActionKind::Boost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleActionKind::Block => "block",
            RuleActionKind::Pin => "pin",
            RuleActionKind::Boost => "boost",
        }
    }
}

/// Item predicate a rule applies to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum RuleTarget {
    Tag(String),
    Brand(String),
    Category(String),
    Items(Vec<String>),
}

impl RuleTarget {
    /// Brand and category values are compared after prefix stripping.
    pub fn matches(
        &self,
        item: &Item,
        brand_prefixes: &[String],
        category_prefixes: &[String],
    ) -> bool {
        match self {
            RuleTarget::Tag(tag) => item.has_tag(tag),
            RuleTarget::Brand(brand) => item
                .prefixed_values(brand_prefixes)
                .iter()
                .any(|b| b.eq_ignore_ascii_case(brand.trim())),
            RuleTarget::Category(category) => item
                .prefixed_values(category_prefixes)
                .iter()
                .any(|c| c.eq_ignore_ascii_case(category.trim())),
            RuleTarget::Items(ids) => ids.iter().any(|id| id == &item.item_id),
        }
    }
}

/// A tenant policy directive scoped to a namespace and surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: Uuid,
    pub namespace: String,
    /// Empty or `*` applies to every surface
    #[serde(default)]
    pub surface: String,
    pub target: RuleTarget,
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
    /// Caps how many items this rule may pin; the global slot budget still applies
    #[serde(default)]
    pub max_pins: Option<usize>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    pub fn new(namespace: impl Into<String>, target: RuleTarget, action: RuleAction) -> Self {
        Self {
            rule_id: Uuid::new_v4(),
            namespace: namespace.into(),
            surface: String::new(),
            target,
            action,
            priority: 0,
            max_pins: None,
            enabled: true,
            valid_from: None,
            valid_until: None,
        }
    }

    pub fn on_surface(mut self, surface: impl Into<String>) -> Self {
        self.surface = surface.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_pins(mut self, max_pins: usize) -> Self {
        self.max_pins = Some(max_pins);
        self
    }

    pub fn applies_to_surface(&self, surface: &str) -> bool {
        let scope = self.surface.trim();
        scope.is_empty() || scope == "*" || scope.eq_ignore_ascii_case(surface.trim())
    }

    /// Validity window is `[valid_from, valid_until)`; open ends are unbounded.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.valid_from.map_or(true, |from| from <= now)
            && self.valid_until.map_or(true, |until| now < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_validity_window_is_half_open() {
        let now = Utc::now();
        let mut rule = Rule::new("default", RuleTarget::Tag("x".into()), RuleAction::Block);
        rule.valid_from = Some(now);
        rule.valid_until = Some(now + Duration::hours(1));
        assert!(rule.is_active(now));
        assert!(!rule.is_active(now + Duration::hours(1)));
        assert!(!rule.is_active(now - Duration::seconds(1)));

        rule.enabled = false;
        assert!(!rule.is_active(now));
    }

    #[test]
    fn test_surface_scope() {
        let rule = Rule::new("default", RuleTarget::Tag("x".into()), RuleAction::Block);
        assert!(rule.applies_to_surface("home"));
        let rule = rule.on_surface("PDP");
        assert!(rule.applies_to_surface("pdp"));
        assert!(!rule.applies_to_surface("home"));
    }

    #[test]
    fn test_target_matching() {
        let brands = vec!["brand:".to_string()];
        let categories = vec!["category:".to_string()];
        let item = Item::new("sku-1").with_tags(["brand:Acme", "category:shoes", "sale"]);

        assert!(RuleTarget::Tag("SALE".into()).matches(&item, &brands, &categories));
        assert!(RuleTarget::Brand("acme".into()).matches(&item, &brands, &categories));
        assert!(RuleTarget::Category("Shoes".into()).matches(&item, &brands, &categories));
        assert!(RuleTarget::Items(vec!["sku-1".into()]).matches(&item, &brands, &categories));
        assert!(!RuleTarget::Brand("other".into()).matches(&item, &brands, &categories));
    }

    #[test]
    fn test_action_wire_format() {
        let action: RuleAction = serde_json::from_str(r#"{"type":"pin","position":2}"#).unwrap();
        assert_eq!(action, RuleAction::Pin { position: 2 });
        assert_eq!(action.kind().as_str(), "pin");
    }

    #[test]
    fn test_max_pins_defaults_to_unbounded() {
        let rule: Rule = serde_json::from_value(serde_json::json!({
            "rule_id": Uuid::nil(),
            "namespace": "default",
            "target": { "type": "tag", "value": "sale" },
            "action": { "type": "pin", "position": 1 },
            "valid_from": null,
            "valid_until": null
        }))
        .unwrap();
        assert_eq!(rule.max_pins, None);
        assert!(rule.enabled);
    }
}
