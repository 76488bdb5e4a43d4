//! Request orchestration: store reads, signal fan-out, blend, policy,
//! diversification and explanations, in that order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::db::{days, RecStore, StoreError, TenantScope};
use crate::error::{AppError, AppResult, InvariantViolation};
use crate::models::{
    BlendWeights, Candidate, Constraints, EventTypeCatalog, Item, PolicySummary,
    RecommendRequest, RecommendResponse, Rule, RuleAction, RuleTarget, SignalKind,
    SimilarRequest,
};
use crate::services::blender::Blender;
use crate::services::diversity::Diversifier;
use crate::services::explain;
use crate::services::metrics::{NoopObserver, PolicyObserver};
use crate::services::policy::{PolicyFilter, PolicyInput};
use crate::services::rules::RuleEvaluator;
use crate::services::signals::{
    CandidateSet, CoVisitationGenerator, PopularityGenerator, ProfileGenerator, SignalGenerator,
    SignalInput,
};

const BUILD_COMMIT: &str = match option_env!("GIT_COMMIT") {
    Some(commit) => commit,
    None => env!("CARGO_PKG_VERSION"),
};

/// Anything that can answer a recommendation request
#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(
        &self,
        ctx: &RequestContext,
        request: &RecommendRequest,
    ) -> AppResult<(RecommendResponse, PolicySummary)>;
}

/// What the shared ranking tail needs besides the generator output
struct RankInput<'a> {
    scope: &'a TenantScope,
    blender: &'a Blender,
    weights: &'a BlendWeights,
    /// Items the request is about; never attached as pins
    seeds: &'a [String],
    surface: &'a str,
    user_id: Option<&'a str>,
    constraints: Option<&'a Constraints>,
    event_weights: &'a EventTypeCatalog,
    k: usize,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn RecStore>,
    observer: Arc<dyn PolicyObserver>,
    generators: Vec<Box<dyn SignalGenerator>>,
    blender: Blender,
    policy: PolicyFilter,
    diversifier: Diversifier,
    config_json: Vec<u8>,
}

impl Engine {
    pub fn new(config: Arc<EngineConfig>, store: Arc<dyn RecStore>) -> Self {
        let generators: Vec<Box<dyn SignalGenerator>> = vec![
            Box::new(PopularityGenerator::new(config.clone())),
            Box::new(CoVisitationGenerator::new(config.clone())),
            Box::new(ProfileGenerator::new(config.clone())),
        ];
        let evaluator = RuleEvaluator::new(
            config.brand_tag_prefixes.clone(),
            config.category_tag_prefixes.clone(),
        )
        .with_max_pin_slots(config.max_pin_slots);

        Self {
            blender: Blender::new(config.default_blend(), config.profile_boost),
            policy: PolicyFilter::new(evaluator),
            diversifier: Diversifier::new(&config),
            config_json: serde_json::to_vec(config.as_ref()).unwrap_or_default(),
            observer: Arc::new(NoopObserver),
            generators,
            config,
            store,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PolicyObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Personalized top-K for one user.
    pub async fn recommend(
        &self,
        ctx: &RequestContext,
        request: &RecommendRequest,
    ) -> AppResult<(RecommendResponse, PolicySummary)> {
        if request.user_id.trim().is_empty() {
            return Err(AppError::InvalidRequest("user_id is required".to_string()));
        }
        let namespace = require_namespace(&request.namespace)?;
        let k = self.validate_k(request.k)?;
        if let Some(constraints) = &request.constraints {
            validate_constraints(constraints)?;
        }
        let weights = self.blender.resolve_weights(request.blend.as_ref())?;

        let ctx = match request.as_of {
            Some(as_of) => ctx.clone().with_now(as_of - chrono::Duration::microseconds(1)),
            None => ctx.clone(),
        };
        let scope = TenantScope::new(ctx.org_id, namespace);
        let surface = surface_or_default(request.surface.as_deref());
        let user_id = request.user_id.trim();

        let event_weights = self.store.event_type_weights(&ctx, &scope).await?;
        let input = SignalInput {
            scope: &scope,
            user_id: Some(user_id),
            seeds: None,
            exclude_item_ids: &[],
            event_weights: &event_weights,
        };
        let (sets, degraded) = self.run_generators(&ctx, &weights, &input).await?;

        let rank = RankInput {
            scope: &scope,
            blender: &self.blender,
            weights: &weights,
            seeds: &[],
            surface: &surface,
            user_id: Some(user_id),
            constraints: request.constraints.as_ref(),
            event_weights: &event_weights,
            k,
        };
        let (list, summary) = self.rank(&ctx, sets, &rank).await?;

        let kind = if weights.beta == 0.0 && weights.gamma == 0.0 {
            "popularity"
        } else {
            "blend"
        };
        let response = RecommendResponse {
            model_version: self.model_version(kind, &weights),
            items: explain::assemble(&list, request.include_reasons),
            degraded,
        };
        debug!(
            namespace = %scope.namespace,
            surface = %surface,
            candidates = summary.total_candidates,
            returned = response.items.len(),
            degraded,
            "Recommendation served"
        );
        Ok((response, summary))
    }

    /// Items co-visited with `request.item_id`, under the same policy and
    /// diversification as [`Engine::recommend`].
    pub async fn similar(
        &self,
        ctx: &RequestContext,
        request: &SimilarRequest,
    ) -> AppResult<(RecommendResponse, PolicySummary)> {
        let item_id = request.item_id.trim();
        if item_id.is_empty() {
            return Err(AppError::InvalidRequest("item_id is required".to_string()));
        }
        let namespace = require_namespace(&request.namespace)?;
        let k = self.validate_k(request.k)?;

        let scope = TenantScope::new(ctx.org_id, namespace);
        let surface = surface_or_default(request.surface.as_deref());
        let seeds = vec![item_id.to_string()];

        let seed_item = self.store.items_by_ids(ctx, &scope, &seeds).await?;
        if !seed_item.contains_key(item_id) {
            return Err(AppError::NotFound(format!("item {}", item_id)));
        }

        let event_weights = self.store.event_type_weights(ctx, &scope).await?;
        let input = SignalInput {
            scope: &scope,
            user_id: None,
            seeds: Some(&seeds),
            exclude_item_ids: &seeds,
            event_weights: &event_weights,
        };
        let weights = BlendWeights::new(0.0, 1.0, 0.0);
        let set = self.run_single(ctx, SignalKind::CoVisitation, &input).await?;
        let blender = Blender::new(weights, 0.0);

        let rank = RankInput {
            scope: &scope,
            blender: &blender,
            weights: &weights,
            seeds: &seeds,
            surface: &surface,
            user_id: None,
            constraints: None,
            event_weights: &event_weights,
            k,
        };
        let (list, summary) = self.rank(ctx, vec![set], &rank).await?;

        let response = RecommendResponse {
            model_version: self.model_version("similar", &weights),
            items: explain::assemble(&list, request.include_reasons),
            degraded: false,
        };
        Ok((response, summary))
    }

    fn validate_k(&self, k: i64) -> AppResult<usize> {
        if k <= 0 {
            return Err(AppError::InvalidRequest("k must be positive".to_string()));
        }
        match usize::try_from(k) {
            Ok(k) if k <= self.config.k_max => Ok(k),
            _ => Err(AppError::LimitTooLarge {
                requested: k,
                max: self.config.k_max,
            }),
        }
    }

    fn generator_active(&self, kind: SignalKind, weights: &BlendWeights) -> bool {
        match kind {
            SignalKind::Profile => self.blender.uses_profile(weights),
            other => weights.weight(other) > 0.0,
        }
    }

    /// Runs every active generator concurrently.
    ///
    /// A generator that exhausted its retries is skipped and the response is
    /// marked degraded, provided another generator succeeded. Permanent
    /// failures and cancellation fail the request.
    async fn run_generators(
        &self,
        ctx: &RequestContext,
        weights: &BlendWeights,
        input: &SignalInput<'_>,
    ) -> AppResult<(Vec<CandidateSet>, bool)> {
        let active: Vec<&dyn SignalGenerator> = self
            .generators
            .iter()
            .map(|g| g.as_ref())
            .filter(|g| self.generator_active(g.kind(), weights))
            .collect();

        let store = self.store.as_ref();
        let fanout = join_all(active.iter().map(|g| g.generate(ctx, input, store)));
        let results = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(AppError::Canceled),
            results = fanout => results,
        };

        let mut sets = Vec::with_capacity(results.len());
        let mut skipped: Vec<(&'static str, StoreError)> = Vec::new();
        for (generator, result) in active.iter().zip(results) {
            match result {
                Ok(set) => sets.push(set),
                Err(err) if err.is_unavailable() => skipped.push((generator.name(), err)),
                Err(err) => return Err(err.into()),
            }
        }

        if skipped.is_empty() {
            return Ok((sets, false));
        }
        if sets.is_empty() {
            let (_, err) = skipped.remove(0);
            return Err(err.into());
        }
        for (name, err) in &skipped {
            warn!(
                generator = *name,
                error = %err,
                "Skipping signal generator, serving degraded"
            );
        }
        Ok((sets, true))
    }

    async fn run_single(
        &self,
        ctx: &RequestContext,
        kind: SignalKind,
        input: &SignalInput<'_>,
    ) -> AppResult<CandidateSet> {
        let Some(generator) = self.generators.iter().find(|g| g.kind() == kind) else {
            return Ok(CandidateSet::empty(kind));
        };
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(AppError::Canceled),
            result = generator.generate(ctx, input, self.store.as_ref()) => Ok(result?),
        }
    }

    /// Items the user interacted with recently. Conversion-like types look back
    /// `purchased_window_days`, the rest `popularity_window_days`.
    async fn recent_excludes(
        &self,
        ctx: &RequestContext,
        scope: &TenantScope,
        user_id: &str,
        event_weights: &EventTypeCatalog,
    ) -> Result<HashSet<String>, StoreError> {
        let (conversion, other): (Vec<i16>, Vec<i16>) = self
            .config
            .exclude_event_types
            .iter()
            .copied()
            .partition(|code| event_weights.is_conversion(*code));

        let mut excluded = HashSet::new();
        for (types, window) in [
            (conversion, self.config.purchased_window_days),
            (other, self.config.popularity_window_days),
        ] {
            if types.is_empty() {
                continue;
            }
            let items = self
                .store
                .recent_event_items(ctx, scope, user_id, &types, ctx.now - days(window))
                .await?;
            excluded.extend(items);
        }
        Ok(excluded)
    }

    /// Blend, policy, diversification and the post-rank self-checks.
    ///
    /// Items pinned by id join the pool even when no signal proposed them.
    async fn rank(
        &self,
        ctx: &RequestContext,
        mut sets: Vec<CandidateSet>,
        input: &RankInput<'_>,
    ) -> AppResult<(Vec<Candidate>, PolicySummary)> {
        let rules = self.store.rules_for(ctx, input.scope, input.surface).await?;
        check_rules(&rules, input, ctx)?;
        let pinned = pinned_item_ids(&rules, input.seeds);

        let ids: Vec<String> = sets
            .iter()
            .flat_map(|set| set.iter().map(|(id, _)| id.clone()))
            .chain(pinned.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let items: HashMap<String, Item> = if ids.is_empty() {
            HashMap::new()
        } else {
            self.store.items_by_ids(ctx, input.scope, &ids).await?
        };

        widen_profile(&mut sets, &items);
        let mut candidates = input.blender.blend(input.weights, &sets);
        let proposed: HashSet<String> = candidates.iter().map(|c| c.item_id.clone()).collect();
        for item_id in pinned {
            if !proposed.contains(&item_id) {
                candidates.push(Candidate::pinned_only(item_id));
            }
        }

        let recent = match input.user_id {
            Some(user_id) if self.config.rule_exclude_events => {
                self.recent_excludes(ctx, input.scope, user_id, input.event_weights)
                    .await?
            }
            _ => HashSet::new(),
        };

        let mut outcome = self.policy.apply(
            candidates,
            &PolicyInput {
                constraints: input.constraints,
                recent_excludes: &recent,
                rules: &rules,
                items: &items,
            },
        );
        if outcome.summary.constraint_leak_count > 0 {
            self.observer
                .observe(&input.scope.namespace, input.surface, &outcome.summary);
            return Err(AppError::Invariant {
                kind: InvariantViolation::LeakDetected,
                message: format!(
                    "policy survivors contain removed items: {:?}",
                    outcome.summary.constraint_leak_ids
                ),
            });
        }

        let survivors = std::mem::take(&mut outcome.survivors);
        let list = self.diversifier.rerank(survivors, &items, input.k);

        let leaked = outcome.find_leaks(list.iter().map(|c| c.item_id.as_str()));
        if outcome.record_leaks(&leaked) {
            error!(
                namespace = %input.scope.namespace,
                leaked = ?leaked,
                "Removed items reached the final list"
            );
            self.observer
                .observe(&input.scope.namespace, input.surface, &outcome.summary);
            return Err(AppError::Invariant {
                kind: InvariantViolation::LeakDetected,
                message: format!("final list contains removed items: {:?}", leaked),
            });
        }

        let unique: HashSet<&str> = list.iter().map(|c| c.item_id.as_str()).collect();
        if list.len() > input.k || unique.len() != list.len() {
            error!(k = input.k, returned = list.len(), "Final list violates the K bound");
            return Err(AppError::Invariant {
                kind: InvariantViolation::KBoundViolation,
                message: format!("{} items for k={}", list.len(), input.k),
            });
        }

        outcome.record_exposure(&list);
        self.observer
            .observe(&input.scope.namespace, input.surface, &outcome.summary);
        Ok((list, outcome.summary))
    }

    /// `<kind>_v1+<commit>.<hash>`, stable for identical config and weights
    fn model_version(&self, kind: &str, weights: &BlendWeights) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.config_json);
        hasher.update(serde_json::to_vec(weights).unwrap_or_default());
        let digest = hex::encode(hasher.finalize());
        format!("{}_v1+{}.{}", kind, BUILD_COMMIT, &digest[..12])
    }
}

#[async_trait]
impl Recommender for Engine {
    async fn recommend(
        &self,
        ctx: &RequestContext,
        request: &RecommendRequest,
    ) -> AppResult<(RecommendResponse, PolicySummary)> {
        Engine::recommend(self, ctx, request).await
    }
}

fn require_namespace(namespace: &str) -> AppResult<&str> {
    let namespace = namespace.trim();
    if namespace.is_empty() {
        return Err(AppError::MissingNamespace);
    }
    Ok(namespace)
}

fn surface_or_default(surface: Option<&str>) -> String {
    match surface.map(str::trim) {
        Some(surface) if !surface.is_empty() => surface.to_string(),
        _ => "default".to_string(),
    }
}

fn validate_constraints(constraints: &Constraints) -> AppResult<()> {
    if let Some([min, max]) = constraints.price_between {
        if !(min.is_finite() && max.is_finite()) || min < 0.0 || min > max {
            return Err(AppError::InvalidRequest(
                "price_between must be [min, max] with 0 <= min <= max".to_string(),
            ));
        }
    }
    Ok(())
}

/// Ids named by pin rules, minus the request's own seeds
fn pinned_item_ids(rules: &[Rule], seeds: &[String]) -> BTreeSet<String> {
    rules
        .iter()
        .filter(|rule| matches!(rule.action, RuleAction::Pin { .. }))
        .filter_map(|rule| match &rule.target {
            RuleTarget::Items(ids) => Some(ids),
            _ => None,
        })
        .flatten()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && !seeds.iter().any(|seed| seed.as_str() == *id))
        .map(str::to_string)
        .collect()
}

/// Rescores the profile signal over every proposed item, not just the
/// generator's own tag pool.
fn widen_profile(sets: &mut [CandidateSet], items: &HashMap<String, Item>) {
    let Some(index) = sets.iter().position(|set| set.kind == SignalKind::Profile) else {
        return;
    };
    let Some(profile) = sets[index].tag_profile().cloned() else {
        return;
    };
    let pool: BTreeSet<&str> = sets
        .iter()
        .flat_map(|set| set.iter().map(|(id, _)| id.as_str()))
        .collect();
    let widened = profile.score_items(pool.into_iter().filter_map(|id| items.get(id)));
    debug!(
        before = sets[index].len(),
        after = widened.len(),
        "Profile scored over the candidate union"
    );
    sets[index] = widened;
}

/// Rules handed back by the store must belong to this request's scope.
fn check_rules(rules: &[Rule], input: &RankInput<'_>, ctx: &RequestContext) -> AppResult<()> {
    let stray = rules.iter().find(|rule| {
        rule.namespace != input.scope.namespace
            || !rule.is_active(ctx.now)
            || !rule.applies_to_surface(input.surface)
    });
    match stray {
        Some(rule) => {
            error!(
                rule_id = %rule.rule_id,
                namespace = %input.scope.namespace,
                "Store returned an out-of-scope rule"
            );
            Err(AppError::Invariant {
                kind: InvariantViolation::RuleInconsistency,
                message: format!("rule {} is outside the request scope", rule.rule_id),
            })
        }
        None => Ok(()),
    }
}
