//! Domain types shared by the store, the pipeline stages and the HTTP surface.

mod catalog;
mod policy;
mod recommendation;
mod rule;

pub use catalog::{
    Event, EventTypeCatalog, EventTypeInfo, Item, User, EVENT_ADD, EVENT_CLICK, EVENT_CUSTOM,
    EVENT_PURCHASE, EVENT_VIEW,
};
pub use policy::{PolicySummary, SUMMARY_SAMPLE_LIMIT};
pub use recommendation::{
    rank_order, BlendWeights, Candidate, Constraints, Pin, RecommendRequest, RecommendResponse,
    RecommendedItem, SignalKind, SimilarRequest,
};
pub use rule::{Rule, RuleAction, RuleActionKind, RuleTarget};
