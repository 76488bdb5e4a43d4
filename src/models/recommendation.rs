use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Blend weights. Internally alpha/beta/gamma; on the wire `pop`/`cooc`/`als`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendWeights {
    #[serde(rename = "pop", alias = "alpha", default)]
    pub alpha: f64,
    #[serde(rename = "cooc", alias = "beta", default)]
    pub beta: f64,
    #[serde(rename = "als", alias = "gamma", default)]
    pub gamma: f64,
}

impl BlendWeights {
    pub fn new(alpha: f64, beta: f64, gamma: f64) -> Self {
        Self { alpha, beta, gamma }
    }

    /// Weights must be finite, non-negative, and at least one positive.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("pop", self.alpha), ("cooc", self.beta), ("als", self.gamma)] {
            if !value.is_finite() {
                return Err(format!("{} weight must be a finite number", name));
            }
            if value < 0.0 {
                return Err(format!("{} weight must not be negative", name));
            }
        }
        if self.alpha <= 0.0 && self.beta <= 0.0 && self.gamma <= 0.0 {
            return Err("at least one weight must be positive".to_string());
        }
        Ok(())
    }

    pub fn weight(&self, kind: SignalKind) -> f64 {
        match kind {
            SignalKind::Popularity => self.alpha,
            SignalKind::CoVisitation => self.beta,
            SignalKind::Profile => self.gamma,
        }
    }
}

/// The signal families feeding the blender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Popularity,
    CoVisitation,
    Profile,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Popularity => "pop",
            SignalKind::CoVisitation => "cooc",
            SignalKind::Profile => "profile",
        }
    }
}

/// Request-level filters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub include_tags_any: Vec<String>,
    #[serde(default)]
    pub exclude_item_ids: Vec<String>,
    /// Inclusive `[min, max]`
    #[serde(default)]
    pub price_between: Option<[f64; 2]>,
    /// Strictly after
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub surface: Option<String>,
    #[serde(default)]
    pub k: i64,
    #[serde(default)]
    pub constraints: Option<Constraints>,
    #[serde(default)]
    pub blend: Option<BlendWeights>,
    #[serde(default)]
    pub include_reasons: bool,
    /// Evaluate as of an earlier instant. Only set by offline tooling.
    #[serde(skip)]
    pub as_of: Option<DateTime<Utc>>,
}

impl RecommendRequest {
    pub fn new(user_id: impl Into<String>, namespace: impl Into<String>, k: i64) -> Self {
        Self {
            user_id: user_id.into(),
            namespace: namespace.into(),
            k,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarRequest {
    pub item_id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub surface: Option<String>,
    #[serde(default)]
    pub k: i64,
    #[serde(default)]
    pub include_reasons: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedItem {
    pub item_id: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasons: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendResponse {
    pub model_version: String,
    pub items: Vec<RecommendedItem>,
    /// Set when a signal generator was skipped after exhausting retries
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

// ============================================================================
// Pipeline-internal types
// ============================================================================

/// Pin placed on a candidate by a rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pin {
    pub position: usize,
    pub priority: i32,
}

/// A candidate moving through blend, policy and diversification
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub item_id: String,
    /// Max-normalized popularity score
    pub pop: f64,
    /// Max-normalized co-visitation score
    pub cooc: f64,
    /// Max-normalized profile score
    pub profile: f64,
    pub combined: f64,
    /// Signals with a non-zero contribution, in `SignalKind` order
    pub provenance: Vec<SignalKind>,
    /// Seed that contributed most to `cooc`
    pub seed: Option<String>,
    /// Profile tag that contributed most to `profile`
    pub top_tag: Option<String>,
    pub pin: Option<Pin>,
    pub boosted: bool,
    /// Latest event time behind any signal; breaks score ties
    pub last_ts: Option<DateTime<Utc>>,
    /// Attached only because a rule pins it; dropped unless a pin slot is granted
    pub pin_only: bool,
}

impl Candidate {
    pub fn new(item_id: impl Into<String>, combined: f64) -> Self {
        Self {
            item_id: item_id.into(),
            pop: 0.0,
            cooc: 0.0,
            profile: 0.0,
            combined,
            provenance: Vec::new(),
            seed: None,
            top_tag: None,
            pin: None,
            boosted: false,
            last_ts: None,
            pin_only: false,
        }
    }

    /// Zero-score candidate for an item no signal proposed but a rule pins
    pub fn pinned_only(item_id: impl Into<String>) -> Self {
        Self {
            pin_only: true,
            ..Self::new(item_id, 0.0)
        }
    }

    pub fn has_signal(&self, kind: SignalKind) -> bool {
        self.provenance.contains(&kind)
    }
}

/// Score-desc, then most recent activity first, then item_id asc
pub fn rank_order(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    b.combined
        .total_cmp(&a.combined)
        .then_with(|| b.last_ts.cmp(&a.last_ts))
        .then_with(|| a.item_id.cmp(&b.item_id))
}
