use prometheus::{IntCounterVec, Opts, Registry};

use crate::models::{PolicySummary, RuleActionKind};

/// Receives the policy summary of every completed request
pub trait PolicyObserver: Send + Sync {
    fn observe(&self, namespace: &str, surface: &str, summary: &PolicySummary);
}

/// Observer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PolicyObserver for NoopObserver {
    fn observe(&self, _namespace: &str, _surface: &str, _summary: &PolicySummary) {}
}

/// Lower-cased, trimmed label value with a `"default"` fallback
pub fn normalize_label(value: &str) -> String {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        "default".to_string()
    } else {
        value
    }
}

/// Prometheus counters for the policy filter
#[derive(Clone)]
pub struct PolicyMetrics {
    include_filter_requests: IntCounterVec,
    include_filter_dropped: IntCounterVec,
    include_filter_leak: IntCounterVec,
    explicit_exclude_hits: IntCounterVec,
    recent_event_exclude_hits: IntCounterVec,
    rule_actions: IntCounterVec,
    rule_exposure: IntCounterVec,
    rule_zero_effect: IntCounterVec,
    response_items: IntCounterVec,
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

const TENANT_LABELS: &[&str] = &["namespace", "surface"];
const ACTION_LABELS: &[&str] = &["namespace", "surface", "action"];

impl PolicyMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            include_filter_requests: counter(
                registry,
                "policy_include_filter_requests_total",
                "Requests carrying an include-tags constraint",
                TENANT_LABELS,
            )?,
            include_filter_dropped: counter(
                registry,
                "policy_include_filter_dropped_total",
                "Candidates dropped by request constraints",
                TENANT_LABELS,
            )?,
            include_filter_leak: counter(
                registry,
                "policy_include_filter_leak_total",
                "Filtered candidates found in a response",
                TENANT_LABELS,
            )?,
            explicit_exclude_hits: counter(
                registry,
                "policy_explicit_exclude_hits_total",
                "Candidates removed by caller exclude lists",
                TENANT_LABELS,
            )?,
            recent_event_exclude_hits: counter(
                registry,
                "policy_recent_event_exclude_hits_total",
                "Candidates removed because the user recently interacted with them",
                TENANT_LABELS,
            )?,
            rule_actions: counter(
                registry,
                "policy_rule_actions_total",
                "Items matched by rule actions",
                ACTION_LABELS,
            )?,
            rule_exposure: counter(
                registry,
                "policy_rule_exposure_total",
                "Rule-matched items present in responses",
                ACTION_LABELS,
            )?,
            rule_zero_effect: counter(
                registry,
                "policy_rule_zero_effect_total",
                "Requests where a rule action matched but left no trace",
                ACTION_LABELS,
            )?,
            response_items: counter(
                registry,
                "policy_response_items_total",
                "Items returned after policy and diversification",
                TENANT_LABELS,
            )?,
        })
    }
}

impl PolicyObserver for PolicyMetrics {
    fn observe(&self, namespace: &str, surface: &str, summary: &PolicySummary) {
        let namespace = normalize_label(namespace);
        let surface = normalize_label(surface);
        let labels = [namespace.as_str(), surface.as_str()];

        if !summary.constraint_include_tags.is_empty() {
            self.include_filter_requests.with_label_values(&labels).inc();
        }
        self.include_filter_dropped
            .with_label_values(&labels)
            .inc_by(summary.constraint_filtered_count as u64);
        self.include_filter_leak
            .with_label_values(&labels)
            .inc_by(summary.constraint_leak_count as u64);
        self.explicit_exclude_hits
            .with_label_values(&labels)
            .inc_by(summary.explicit_exclude_hits as u64);
        self.recent_event_exclude_hits
            .with_label_values(&labels)
            .inc_by(summary.recent_event_exclude_hits as u64);

        for kind in RuleActionKind::ALL {
            let action_labels = [namespace.as_str(), surface.as_str(), kind.as_str()];
            self.rule_actions
                .with_label_values(&action_labels)
                .inc_by(summary.rule_count(kind) as u64);
            self.rule_exposure
                .with_label_values(&action_labels)
                .inc_by(summary.rule_exposure(kind) as u64);
        }
        for kind in summary.zero_effect_actions() {
            self.rule_zero_effect
                .with_label_values(&[namespace.as_str(), surface.as_str(), kind.as_str()])
                .inc();
        }

        self.response_items
            .with_label_values(&labels)
            .inc_by(summary.final_count as u64);
    }
}
