use crate::models::{Candidate, RecommendedItem, SignalKind};

/// Human-readable reasons derived from a candidate's provenance and rule marks
pub fn reasons(candidate: &Candidate) -> Vec<String> {
    let mut reasons = Vec::new();
    if candidate.has_signal(SignalKind::Popularity) {
        reasons.push("popular".to_string());
    }
    if candidate.has_signal(SignalKind::CoVisitation) {
        if let Some(seed) = &candidate.seed {
            reasons.push(format!("because you viewed {}", seed));
        }
    }
    if candidate.has_signal(SignalKind::Profile) {
        if let Some(tag) = &candidate.top_tag {
            reasons.push(format!("matches your interest in {}", tag));
        }
    }
    if candidate.pin.is_some() {
        reasons.push("pinned".to_string());
    }
    if candidate.boosted {
        reasons.push("boosted".to_string());
    }
    reasons
}

/// Converts the final list into response items.
pub fn assemble(list: &[Candidate], include_reasons: bool) -> Vec<RecommendedItem> {
    list.iter()
        .map(|candidate| RecommendedItem {
            item_id: candidate.item_id.clone(),
            score: candidate.combined,
            reasons: include_reasons.then(|| reasons(candidate)),
        })
        .collect()
}
