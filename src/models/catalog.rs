use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A catalog item as seen by the recommendation core
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub item_id: String,
    pub available: bool,
    pub price: Option<f64>,
    pub tags: Vec<String>,
    /// Opaque client properties, never interpreted by the core
    #[serde(default)]
    pub props: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Creates an available, untagged item with no price
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            available: true,
            price: None,
            tags: Vec::new(),
            props: serde_json::Value::Null,
            created_at: DateTime::<Utc>::default(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn created(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Values of tags carrying one of `prefixes`, lowercased with the prefix stripped.
    pub fn prefixed_values(&self, prefixes: &[String]) -> Vec<String> {
        let mut values: Vec<String> = self
            .tags
            .iter()
            .filter_map(|tag| {
                let lowered = tag.trim().to_lowercase();
                prefixes.iter().find_map(|prefix| {
                    lowered
                        .strip_prefix(&prefix.to_lowercase())
                        .map(|rest| rest.trim().to_string())
                        .filter(|rest| !rest.is_empty())
                })
            })
            .collect();
        values.sort();
        values.dedup();
        values
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.trim().eq_ignore_ascii_case(tag.trim()))
    }
}

/// An immutable interaction record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub user_id: String,
    pub item_id: String,
    pub event_type: i16,
    #[serde(default = "default_event_value")]
    pub value: f64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

fn default_event_value() -> f64 {
    1.0
}

impl Event {
    pub fn new(
        user_id: impl Into<String>,
        item_id: impl Into<String>,
        event_type: i16,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            event_type,
            value: default_event_value(),
            ts,
            meta: serde_json::Value::Null,
        }
    }
}

/// A user record. Activity is derived from events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub user_id: String,
    #[serde(default)]
    pub traits: serde_json::Value,
}

pub const EVENT_VIEW: i16 = 0;
pub const EVENT_CLICK: i16 = 1;
pub const EVENT_ADD: i16 = 2;
pub const EVENT_PURCHASE: i16 = 3;
pub const EVENT_CUSTOM: i16 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventTypeInfo {
    pub name: String,
    pub weight: f64,
    pub is_conversion: bool,
}

/// Event-type weights for one tenant, keyed by type code
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventTypeCatalog {
    types: BTreeMap<i16, EventTypeInfo>,
}

impl EventTypeCatalog {
    /// The catalog used when a tenant has no overrides
    pub fn defaults() -> Self {
        let mut types = BTreeMap::new();
        for (code, name, weight, is_conversion) in [
            (EVENT_VIEW, "view", 0.1, false),
            (EVENT_CLICK, "click", 0.3, false),
            (EVENT_ADD, "add", 0.7, true),
            (EVENT_PURCHASE, "purchase", 1.0, true),
            (EVENT_CUSTOM, "custom", 0.2, false),
        ] {
            types.insert(
                code,
                EventTypeInfo {
                    name: name.to_string(),
                    weight,
                    is_conversion,
                },
            );
        }
        Self { types }
    }

    /// Tenant rows replace defaults with the same code
    pub fn with_override(mut self, code: i16, info: EventTypeInfo) -> Self {
        self.types.insert(code, info);
        self
    }

    /// Unknown codes carry no weight
    pub fn weight(&self, code: i16) -> f64 {
        self.types.get(&code).map(|t| t.weight).unwrap_or(0.0)
    }

    pub fn is_conversion(&self, code: i16) -> bool {
        self.types.get(&code).is_some_and(|t| t.is_conversion)
    }

    pub fn get(&self, code: i16) -> Option<&EventTypeInfo> {
        self.types.get(&code)
    }

    /// Parallel code/weight arrays, in code order
    pub fn as_arrays(&self) -> (Vec<i16>, Vec<f64>) {
        self.types.iter().map(|(code, t)| (*code, t.weight)).unzip()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_weights() {
        let catalog = EventTypeCatalog::defaults();
        assert_eq!(catalog.weight(EVENT_VIEW), 0.1);
        assert_eq!(catalog.weight(EVENT_PURCHASE), 1.0);
        assert!(catalog.is_conversion(EVENT_PURCHASE));
        assert!(!catalog.is_conversion(EVENT_CLICK));
        assert_eq!(catalog.weight(42), 0.0);
    }

    #[test]
    fn test_override_replaces_default() {
        let catalog = EventTypeCatalog::defaults().with_override(
            EVENT_VIEW,
            EventTypeInfo {
                name: "impression".to_string(),
                weight: 0.05,
                is_conversion: false,
            },
        );
        assert_eq!(catalog.weight(EVENT_VIEW), 0.05);
        let (codes, weights) = catalog.as_arrays();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
        assert_eq!(weights[0], 0.05);
    }

    #[test]
    fn test_prefixed_values_strip_and_lowercase() {
        let item = Item::new("a").with_tags(["Brand:Acme", "cat:Shoes", "red", "brand: "]);
        assert_eq!(item.prefixed_values(&["brand:".to_string()]), vec!["acme"]);
        assert_eq!(
            item.prefixed_values(&["category:".to_string(), "cat:".to_string()]),
            vec!["shoes"]
        );
        assert!(item.has_tag("RED"));
    }
}
