use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use proptest::prelude::*;
use uuid::Uuid;

use recsys_api::config::EngineConfig;
use recsys_api::context::RequestContext;
use recsys_api::db::memory::TenantSnapshot;
use recsys_api::db::{MemoryStore, TenantScope};
use recsys_api::models::{
    BlendWeights, Constraints, Event, Item, RecommendRequest, RecommendResponse, Rule, RuleAction,
    RuleTarget, EVENT_VIEW,
};
use recsys_api::services::Engine;

const NAMESPACE: &str = "catalog";
const TAGS: [&str; 3] = ["t0", "t1", "t2"];
const BRANDS: [&str; 3] = ["brand:b0", "brand:b1", "brand:b2"];

#[derive(Debug, Clone)]
struct GenItem {
    tags: Vec<usize>,
    brand: usize,
    price: Option<f64>,
    views: usize,
    seen_by_shopper: bool,
}

fn gen_item() -> impl Strategy<Value = GenItem> {
    (
        proptest::collection::vec(0..TAGS.len(), 0..3),
        0..BRANDS.len(),
        proptest::option::of(1.0f64..100.0),
        0usize..8,
        any::<bool>(),
    )
        .prop_map(|(tags, brand, price, views, seen_by_shopper)| GenItem {
            tags,
            brand,
            price,
            views,
            seen_by_shopper,
        })
}

fn catalog() -> impl Strategy<Value = Vec<GenItem>> {
    proptest::collection::vec(gen_item(), 2..16)
}

fn item_id(index: usize) -> String {
    format!("item-{:02}", index)
}

fn build_items(catalog: &[GenItem]) -> Vec<Item> {
    catalog
        .iter()
        .enumerate()
        .map(|(i, gen)| {
            let mut tags: Vec<&str> = gen.tags.iter().map(|t| TAGS[*t]).collect();
            tags.push(BRANDS[gen.brand]);
            let item = Item::new(item_id(i)).with_tags(tags);
            match gen.price {
                Some(price) => item.with_price(price),
                None => item,
            }
        })
        .collect()
}

fn build_events(catalog: &[GenItem], ctx: &RequestContext) -> Vec<Event> {
    let mut events = background_views(catalog, ctx);
    for (i, gen) in catalog.iter().enumerate() {
        if gen.seen_by_shopper {
            events.push(Event::new(
                "shopper",
                item_id(i),
                EVENT_VIEW,
                ctx.now - Duration::hours(1),
            ));
        }
    }
    events
}

/// Anonymous views, all sharing one timestamp
fn background_views(catalog: &[GenItem], ctx: &RequestContext) -> Vec<Event> {
    let ts = ctx.now - Duration::hours(6);
    let mut events = Vec::new();
    for (i, gen) in catalog.iter().enumerate() {
        for v in 0..gen.views {
            events.push(Event::new(format!("viewer-{}", v), item_id(i), EVENT_VIEW, ts));
        }
    }
    events
}

fn engine_for(ctx: &RequestContext, snapshot: TenantSnapshot, config: EngineConfig) -> Engine {
    let store =
        MemoryStore::new().with_tenant(TenantScope::new(ctx.org_id, NAMESPACE), snapshot);
    Engine::new(Arc::new(config), Arc::new(store))
}

fn recommend(
    engine: &Engine,
    ctx: &RequestContext,
    request: &RecommendRequest,
) -> RecommendResponse {
    let (response, _) = tokio_test::block_on(engine.recommend(ctx, request))
        .expect("recommendation succeeds");
    response
}

fn ids(response: &RecommendResponse) -> Vec<String> {
    response.items.iter().map(|i| i.item_id.clone()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_no_forbidden_item_is_returned(
        catalog in catalog(),
        include in proptest::collection::vec(0..TAGS.len(), 0..2),
        excluded in proptest::collection::vec(0usize..16, 0..4),
        price_cap in proptest::option::of(10.0f64..90.0),
        k in 1i64..12,
    ) {
        let ctx = RequestContext::new(Uuid::new_v4());
        let items = build_items(&catalog);
        let snapshot = TenantSnapshot::new()
            .items(items.clone())
            .events(build_events(&catalog, &ctx))
            .rule(Rule::new(NAMESPACE, RuleTarget::Tag("t0".into()), RuleAction::Block));
        let engine = engine_for(&ctx, snapshot, EngineConfig::default());

        let constraints = Constraints {
            include_tags_any: include.iter().map(|t| TAGS[*t].to_string()).collect(),
            exclude_item_ids: excluded.iter().map(|i| item_id(*i)).collect(),
            price_between: price_cap.map(|cap| [0.0, cap]),
            created_after: None,
        };
        let request = RecommendRequest {
            constraints: Some(constraints.clone()),
            ..RecommendRequest::new("shopper", NAMESPACE, k)
        };
        let response = recommend(&engine, &ctx, &request);

        let by_id: HashMap<&str, &Item> =
            items.iter().map(|item| (item.item_id.as_str(), item)).collect();
        for returned in ids(&response) {
            let item = by_id[returned.as_str()];
            prop_assert!(!constraints.exclude_item_ids.contains(&returned));
            prop_assert!(!item.has_tag("t0"), "blocked item {} returned", returned);
            if !constraints.include_tags_any.is_empty() {
                prop_assert!(constraints.include_tags_any.iter().any(|t| item.has_tag(t)));
            }
            if let Some([min, max]) = constraints.price_between {
                let price = item.price.expect("priced item");
                prop_assert!(price >= min && price <= max);
            }
        }
    }

    #[test]
    fn test_lists_are_bounded_and_unique(catalog in catalog(), k in 1i64..20) {
        let ctx = RequestContext::new(Uuid::new_v4());
        let snapshot = TenantSnapshot::new()
            .items(build_items(&catalog))
            .events(build_events(&catalog, &ctx));
        let engine = engine_for(&ctx, snapshot, EngineConfig::default());

        let response = recommend(&engine, &ctx, &RecommendRequest::new("shopper", NAMESPACE, k));

        let returned = ids(&response);
        prop_assert!(returned.len() <= k as usize);
        let unique: HashSet<&String> = returned.iter().collect();
        prop_assert_eq!(unique.len(), returned.len());
    }

    #[test]
    fn test_same_inputs_give_identical_responses(catalog in catalog(), k in 1i64..12) {
        let ctx = RequestContext::new(Uuid::new_v4());
        let snapshot = TenantSnapshot::new()
            .items(build_items(&catalog))
            .events(build_events(&catalog, &ctx));
        let engine = engine_for(&ctx, snapshot, EngineConfig::default());
        let request = RecommendRequest {
            include_reasons: true,
            ..RecommendRequest::new("shopper", NAMESPACE, k)
        };

        let first = serde_json::to_string(&recommend(&engine, &ctx, &request)).unwrap();
        let second = serde_json::to_string(&recommend(&engine, &ctx, &request)).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn test_popularity_is_monotone_in_event_count(catalog in catalog()) {
        let ctx = RequestContext::new(Uuid::new_v4());
        let snapshot = TenantSnapshot::new()
            .items(build_items(&catalog))
            .events(background_views(&catalog, &ctx));
        let engine = engine_for(&ctx, snapshot, EngineConfig {
            mmr_lambda: 1.0,
            ..Default::default()
        });
        let request = RecommendRequest {
            blend: Some(BlendWeights::new(1.0, 0.0, 0.0)),
            ..RecommendRequest::new("newcomer", NAMESPACE, catalog.len() as i64)
        };

        let response = recommend(&engine, &ctx, &request);

        let views = |id: &str| {
            let index: usize = id.trim_start_matches("item-").parse().unwrap();
            catalog[index].views
        };
        let expected = catalog.iter().filter(|gen| gen.views > 0).count();
        prop_assert_eq!(response.items.len(), expected);
        for pair in response.items.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
            prop_assert!(views(&pair[0].item_id) >= views(&pair[1].item_id));
        }
    }

    #[test]
    fn test_scaling_weights_keeps_order(
        catalog in catalog(),
        alpha in 0.1f64..2.0,
        beta in 0.0f64..2.0,
        gamma in 0.0f64..2.0,
        exponent in 1u32..4,
    ) {
        let ctx = RequestContext::new(Uuid::new_v4());
        let snapshot = TenantSnapshot::new()
            .items(build_items(&catalog))
            .events(build_events(&catalog, &ctx));
        let engine = engine_for(&ctx, snapshot, EngineConfig::default());
        let factor = f64::from(2u32.pow(exponent));

        let base = RecommendRequest {
            blend: Some(BlendWeights::new(alpha, beta, gamma)),
            ..RecommendRequest::new("shopper", NAMESPACE, 10)
        };
        let scaled = RecommendRequest {
            blend: Some(BlendWeights::new(alpha * factor, beta * factor, gamma * factor)),
            ..base.clone()
        };

        prop_assert_eq!(
            ids(&recommend(&engine, &ctx, &base)),
            ids(&recommend(&engine, &ctx, &scaled))
        );
    }

    #[test]
    fn test_brand_cap_holds_without_pins(catalog in catalog(), cap in 1usize..3, k in 1i64..16) {
        let ctx = RequestContext::new(Uuid::new_v4());
        let items = build_items(&catalog);
        let snapshot = TenantSnapshot::new()
            .items(items)
            .events(build_events(&catalog, &ctx));
        let engine = engine_for(&ctx, snapshot, EngineConfig {
            brand_cap: cap,
            ..Default::default()
        });

        let response = recommend(&engine, &ctx, &RecommendRequest::new("shopper", NAMESPACE, k));

        let mut per_brand: HashMap<usize, usize> = HashMap::new();
        for id in ids(&response) {
            let index: usize = id.trim_start_matches("item-").parse().unwrap();
            *per_brand.entry(catalog[index].brand).or_default() += 1;
        }
        prop_assert!(per_brand.values().all(|count| *count <= cap));
    }

    #[test]
    fn test_pinned_item_takes_its_slot(
        catalog in catalog(),
        target in 0usize..16,
        position in 1usize..6,
        k in 5i64..12,
    ) {
        let ctx = RequestContext::new(Uuid::new_v4());
        let pinned = item_id(target % catalog.len());
        let snapshot = TenantSnapshot::new()
            .items(build_items(&catalog))
            .events(build_events(&catalog, &ctx))
            .rule(Rule::new(NAMESPACE, RuleTarget::Tag("t0".into()), RuleAction::Block))
            .rule(Rule::new(
                NAMESPACE,
                RuleTarget::Items(vec![pinned.clone()]),
                RuleAction::Pin { position },
            ));
        let engine = engine_for(&ctx, snapshot, EngineConfig::default());

        let response = recommend(&engine, &ctx, &RecommendRequest::new("shopper", NAMESPACE, k));

        let returned = ids(&response);
        let expected = (position - 1).min(returned.len().saturating_sub(1));
        prop_assert_eq!(returned.iter().position(|id| *id == pinned), Some(expected));
        prop_assert!(returned.len() <= k as usize);
    }
}
