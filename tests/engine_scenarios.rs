use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use prometheus::Registry;
use uuid::Uuid;

use recsys_api::config::EngineConfig;
use recsys_api::context::RequestContext;
use recsys_api::db::memory::TenantSnapshot;
use recsys_api::db::{MemoryStore, TenantScope};
use recsys_api::models::{
    BlendWeights, Constraints, Event, Item, RecommendRequest, Rule, RuleAction, RuleTarget,
    EVENT_CLICK, EVENT_PURCHASE, EVENT_VIEW,
};
use recsys_api::services::{
    BlendHarness, CandidateConfig, Engine, HarnessOptions, PolicyMetrics,
};

const NAMESPACE: &str = "retail";

fn views(item: &str, count: usize, ts: DateTime<Utc>) -> Vec<Event> {
    (0..count)
        .map(|i| Event::new(format!("{}-viewer-{}", item, i), item, EVENT_VIEW, ts))
        .collect()
}

fn ids(response: &recsys_api::models::RecommendResponse) -> Vec<&str> {
    response.items.iter().map(|i| i.item_id.as_str()).collect()
}

fn engine(org_id: Uuid, snapshot: TenantSnapshot, config: EngineConfig) -> Engine {
    let store = MemoryStore::new().with_tenant(TenantScope::new(org_id, NAMESPACE), snapshot);
    Engine::new(Arc::new(config), Arc::new(store))
}

fn popularity_only(k: i64) -> RecommendRequest {
    RecommendRequest {
        blend: Some(BlendWeights::new(1.0, 0.0, 0.0)),
        ..RecommendRequest::new("new-user", NAMESPACE, k)
    }
}

#[tokio::test]
async fn test_popularity_for_user_without_history() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let mut events = Vec::new();
    for (item, count, days_ago) in [("A", 10, 1), ("B", 3, 3), ("C", 1, 6)] {
        events.extend(views(item, count, ctx.now - Duration::days(days_ago)));
    }
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new()
            .items(["A", "B", "C"].map(Item::new))
            .events(events),
        EngineConfig {
            half_life_days: 7.0,
            ..Default::default()
        },
    );

    let (response, _) = engine.recommend(&ctx, &popularity_only(3)).await.unwrap();

    assert_eq!(ids(&response), vec!["A", "B", "C"]);
    assert!(response.items[0].score > response.items[1].score);
    assert!(response.items[1].score > response.items[2].score);
}

#[tokio::test]
async fn test_co_visitation_excludes_seed() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let now = ctx.now;
    let mut events = vec![Event::new("U", "A", EVENT_CLICK, now - Duration::hours(1))];
    for i in 0..5 {
        let user = format!("b-{}", i);
        events.push(Event::new(&user, "A", EVENT_VIEW, now - Duration::days(2)));
        events.push(Event::new(&user, "B", EVENT_VIEW, now - Duration::days(2)));
    }
    for i in 0..2 {
        let user = format!("c-{}", i);
        events.push(Event::new(&user, "A", EVENT_VIEW, now - Duration::days(2)));
        events.push(Event::new(&user, "C", EVENT_VIEW, now - Duration::days(2)));
    }
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new()
            .items(["A", "B", "C"].map(Item::new))
            .events(events),
        EngineConfig::default(),
    );
    let request = RecommendRequest {
        blend: Some(BlendWeights::new(0.0, 1.0, 0.0)),
        include_reasons: true,
        ..RecommendRequest::new("U", NAMESPACE, 2)
    };

    let (response, _) = engine.recommend(&ctx, &request).await.unwrap();

    assert_eq!(ids(&response), vec!["B", "C"]);
    assert_eq!(
        response.items[0].reasons.as_deref(),
        Some(&["because you viewed A".to_string()][..])
    );
}

#[tokio::test]
async fn test_include_tag_constraint() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let ts = ctx.now - Duration::days(1);
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new()
            .items([
                Item::new("A").with_tags(["x"]),
                Item::new("B").with_tags(["y"]),
                Item::new("C").with_tags(["x"]),
            ])
            .events([views("A", 3, ts), views("B", 5, ts), views("C", 1, ts)].concat()),
        EngineConfig::default(),
    );
    let request = RecommendRequest {
        constraints: Some(Constraints {
            include_tags_any: vec!["x".into()],
            ..Default::default()
        }),
        ..popularity_only(3)
    };

    let (response, summary) = engine.recommend(&ctx, &request).await.unwrap();

    assert_eq!(ids(&response), vec!["A", "C"]);
    assert_eq!(summary.constraint_filtered_count, 1);
    assert_eq!(summary.constraint_filtered_ids, vec!["B"]);
    assert_eq!(summary.constraint_leak_count, 0);
}

#[tokio::test]
async fn test_explicit_exclude_beats_pin() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let ts = ctx.now - Duration::days(1);
    let registry = Registry::new();
    let metrics = PolicyMetrics::new(&registry).unwrap();
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new()
            .items(["A", "B", "C"].map(Item::new))
            .events([views("A", 5, ts), views("B", 3, ts), views("C", 1, ts)].concat())
            .rule(Rule::new(
                NAMESPACE,
                RuleTarget::Items(vec!["B".into()]),
                RuleAction::Pin { position: 1 },
            )),
        EngineConfig::default(),
    )
    .with_observer(Arc::new(metrics));
    let request = RecommendRequest {
        constraints: Some(Constraints {
            exclude_item_ids: vec!["B".into()],
            ..Default::default()
        }),
        ..popularity_only(3)
    };

    let (response, summary) = engine.recommend(&ctx, &request).await.unwrap();

    assert_eq!(ids(&response), vec!["A", "C"]);
    assert_eq!(summary.explicit_exclude_hits, 1);
    assert_eq!(summary.rule_pin_count, 1);
    assert_eq!(summary.rule_pin_exposure, 0);

    let zero_effect = registry
        .gather()
        .into_iter()
        .find(|family| family.get_name() == "policy_rule_zero_effect_total")
        .expect("zero effect counter registered");
    let pin = zero_effect
        .get_metric()
        .iter()
        .find(|m| m.get_label().iter().any(|l| l.get_value() == "pin"))
        .expect("pin label present");
    assert_eq!(pin.get_counter().get_value() as u64, 1);
}

#[tokio::test]
async fn test_brand_cap_truncates_list() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let ts = ctx.now - Duration::days(1);
    let mut items = Vec::new();
    let mut events = Vec::new();
    for i in 0..8 {
        let id = format!("acme-{}", i);
        items.push(Item::new(&id).with_tags(["brand:acme"]));
        events.extend(views(&id, 20 - i, ts));
    }
    for i in 0..2 {
        let id = format!("other-{}", i);
        items.push(Item::new(&id).with_tags(["brand:other"]));
        events.extend(views(&id, 2 - i, ts));
    }
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new().items(items).events(events),
        EngineConfig {
            brand_cap: 3,
            mmr_lambda: 1.0,
            ..Default::default()
        },
    );

    let (response, summary) = engine.recommend(&ctx, &popularity_only(6)).await.unwrap();

    assert_eq!(
        ids(&response),
        vec!["acme-0", "acme-1", "acme-2", "other-0", "other-1"]
    );
    assert_eq!(summary.final_count, 5);
}

#[tokio::test]
async fn test_pin_attaches_item_without_signals() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let ts = ctx.now - Duration::days(1);
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new()
            .items(["A", "B", "C"].map(Item::new))
            .events([views("A", 5, ts), views("B", 3, ts)].concat())
            .rule(Rule::new(
                NAMESPACE,
                RuleTarget::Items(vec!["C".into()]),
                RuleAction::Pin { position: 1 },
            )),
        EngineConfig::default(),
    );
    let request = RecommendRequest {
        include_reasons: true,
        ..popularity_only(3)
    };

    let (response, summary) = engine.recommend(&ctx, &request).await.unwrap();

    assert_eq!(ids(&response), vec!["C", "A", "B"]);
    assert_eq!(
        response.items[0].reasons.as_deref(),
        Some(&["pinned".to_string()][..])
    );
    assert_eq!(summary.rule_pin_count, 1);
    assert_eq!(summary.rule_pin_exposure, 1);
}

#[tokio::test]
async fn test_pin_for_unknown_item_is_unavailable() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let ts = ctx.now - Duration::days(1);
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new()
            .items([Item::new("A"), Item::new("gone").unavailable()])
            .events(views("A", 2, ts))
            .rule(Rule::new(
                NAMESPACE,
                RuleTarget::Items(vec!["gone".into(), "ghost".into()]),
                RuleAction::Pin { position: 1 },
            )),
        EngineConfig::default(),
    );

    let (response, summary) = engine.recommend(&ctx, &popularity_only(3)).await.unwrap();

    assert_eq!(ids(&response), vec!["A"]);
    assert_eq!(summary.unavailable_count, 2);
    assert_eq!(summary.constraint_leak_count, 0);
}

#[tokio::test]
async fn test_profile_credits_items_outside_its_tag_pool() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let now = ctx.now;
    let recent = now - Duration::days(1);
    let mut events = [views("old", 5, recent), views("plain", 6, recent)].concat();
    events.push(Event::new("shopper", "seen", EVENT_VIEW, recent));
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new()
            .items([
                Item::new("old").with_tags(["shoes"]),
                Item::new("seen").with_tags(["shoes"]),
                Item::new("fresh")
                    .with_tags(["shoes"])
                    .created(now - Duration::days(1)),
                Item::new("plain"),
            ])
            .events(events),
        EngineConfig {
            profile_fanout: 1,
            profile_min_events_for_boost: 0,
            ..Default::default()
        },
    );
    let request = RecommendRequest {
        blend: Some(BlendWeights::new(1.0, 0.0, 1.0)),
        include_reasons: true,
        ..RecommendRequest::new("shopper", NAMESPACE, 4)
    };

    let (response, _) = engine.recommend(&ctx, &request).await.unwrap();

    assert_eq!(response.items[0].item_id, "old");
    assert_eq!(
        response.items[0].reasons,
        Some(vec![
            "popular".to_string(),
            "matches your interest in shoes".to_string()
        ])
    );
    assert!(ids(&response).contains(&"fresh"));
}

#[tokio::test]
async fn test_recent_events_exclude_by_type_window() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let now = ctx.now;
    let ts = now - Duration::days(1);
    let mut events =
        [views("A", 5, ts), views("B", 3, ts), views("C", 2, ts), views("D", 1, ts)].concat();
    events.push(Event::new("U", "A", EVENT_PURCHASE, now - Duration::days(10)));
    events.push(Event::new("U", "D", EVENT_VIEW, now - Duration::days(10)));
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new()
            .items(["A", "B", "C", "D"].map(Item::new))
            .events(events),
        EngineConfig {
            rule_exclude_events: true,
            exclude_event_types: vec![EVENT_PURCHASE, EVENT_VIEW],
            purchased_window_days: 30.0,
            popularity_window_days: 5.0,
            ..Default::default()
        },
    );
    let request = RecommendRequest {
        blend: Some(BlendWeights::new(1.0, 0.0, 0.0)),
        ..RecommendRequest::new("U", NAMESPACE, 4)
    };

    let (response, summary) = engine.recommend(&ctx, &request).await.unwrap();

    assert_eq!(ids(&response), vec!["B", "C", "D"]);
    assert_eq!(summary.recent_event_exclude_hits, 1);
}

#[tokio::test]
async fn test_pinned_items_may_exceed_brand_cap() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let ts = ctx.now - Duration::days(1);
    let engine = engine(
        ctx.org_id,
        TenantSnapshot::new()
            .items([
                Item::new("acme-0").with_tags(["brand:acme"]),
                Item::new("acme-1").with_tags(["brand:acme"]),
                Item::new("acme-2").with_tags(["brand:acme"]),
                Item::new("other-0").with_tags(["brand:other"]),
            ])
            .events(
                [
                    views("acme-0", 9, ts),
                    views("acme-1", 8, ts),
                    views("acme-2", 7, ts),
                    views("other-0", 1, ts),
                ]
                .concat(),
            )
            .rule(Rule::new(
                NAMESPACE,
                RuleTarget::Items(vec!["acme-0".into(), "acme-1".into()]),
                RuleAction::Pin { position: 1 },
            )),
        EngineConfig {
            brand_cap: 1,
            mmr_lambda: 1.0,
            ..Default::default()
        },
    );

    let (response, _) = engine.recommend(&ctx, &popularity_only(4)).await.unwrap();

    assert_eq!(ids(&response), vec!["acme-0", "acme-1", "other-0"]);
}

#[tokio::test]
async fn test_harness_scores_holdouts() {
    let ctx = RequestContext::new(Uuid::new_v4());
    let now = ctx.now;
    let background = now - Duration::days(2);
    let history = now - Duration::days(1);

    let mut events = [
        views("top", 30, background),
        views("second", 20, background),
        views("third", 10, background),
    ]
    .concat();
    for user in ["u1", "u2"] {
        for i in 0..4 {
            events.push(Event::new(user, "fourth", EVENT_VIEW, history + Duration::minutes(i)));
        }
    }
    events.push(Event::new("u1", "top", EVENT_VIEW, now - Duration::hours(1)));
    events.push(Event::new("u2", "third", EVENT_VIEW, now - Duration::hours(2)));

    let store = MemoryStore::new().with_tenant(
        TenantScope::new(ctx.org_id, NAMESPACE),
        TenantSnapshot::new()
            .items(["top", "second", "third", "fourth"].map(Item::new))
            .events(events),
    );
    let engine = Engine::new(Arc::new(EngineConfig::default()), Arc::new(store.clone()));
    let options = HarnessOptions {
        k: 3,
        ..HarnessOptions::new(NAMESPACE)
    };
    let candidates = vec![
        CandidateConfig::new("baseline", 1.0, 0.0, 0.0),
        CandidateConfig::new("scaled", 2.0, 0.0, 0.0),
    ];

    let results = BlendHarness::new(&engine, &store)
        .run(&ctx, &options, &candidates)
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.total, 2);
        assert_eq!(result.failures, 0);
        assert_eq!(result.hit_rate, 1.0);
        assert!((result.mrr - 0.6667).abs() < 1e-3);
        assert_eq!(result.avg_rank, 2.0);
    }
    assert_eq!(results[0].name, "baseline");
}
