//! Offline blend evaluation over held-out events.
//!
//! Each sampled user's most recent event is the holdout; the recommender is
//! asked for a list as of just before that event, and every candidate weight
//! triple is scored by hit rate, MRR, average rank and catalog coverage.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::RequestContext;
use crate::db::{HoldoutSample, RecStore, TenantScope};
use crate::error::{AppError, AppResult};
use crate::models::{BlendWeights, RecommendRequest};
use crate::services::engine::Recommender;

/// A named weight triple to evaluate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateConfig {
    pub name: String,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl CandidateConfig {
    pub fn new(name: impl Into<String>, alpha: f64, beta: f64, gamma: f64) -> Self {
        Self {
            name: name.into(),
            alpha,
            beta,
            gamma,
        }
    }

    pub fn weights(&self) -> BlendWeights {
        BlendWeights::new(self.alpha, self.beta, self.gamma)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "candidate name is required".to_string(),
            ));
        }
        self.weights()
            .validate()
            .map_err(|e| AppError::InvalidBlend(format!("{}: {}", self.name, e)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessOptions {
    pub namespace: String,
    pub k: i64,
    pub limit: usize,
    pub min_events: usize,
    pub lookback_days: f64,
}

impl HarnessOptions {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            k: 20,
            limit: 200,
            min_events: 5,
            lookback_days: 30.0,
        }
    }
}

/// Scores for one candidate config
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvalResult {
    pub name: String,
    pub total: usize,
    pub hits: usize,
    pub hit_rate: f64,
    pub mrr: f64,
    /// Mean 1-based rank over hits only
    pub avg_rank: f64,
    pub coverage: f64,
    pub avg_list_length: f64,
    pub failures: usize,
}

/// Running tallies folded into an [`EvalResult`]
#[derive(Debug, Default)]
struct Tally {
    total: usize,
    hits: usize,
    reciprocal_sum: f64,
    rank_sum: usize,
    list_length_sum: usize,
    failures: usize,
    seen: HashSet<String>,
}

impl Tally {
    fn record(&mut self, holdout: &str, list: &[String]) {
        self.total += 1;
        self.list_length_sum += list.len();
        self.seen.extend(list.iter().cloned());
        if let Some(pos) = list.iter().position(|id| id == holdout) {
            let rank = pos + 1;
            self.hits += 1;
            self.rank_sum += rank;
            self.reciprocal_sum += 1.0 / rank as f64;
        }
    }

    fn finish(self, name: &str, k: usize) -> EvalResult {
        let ratio = |num: f64, den: usize| if den == 0 { 0.0 } else { num / den as f64 };
        EvalResult {
            name: name.to_string(),
            total: self.total,
            hits: self.hits,
            hit_rate: ratio(self.hits as f64, self.total),
            mrr: ratio(self.reciprocal_sum, self.total),
            avg_rank: ratio(self.rank_sum as f64, self.hits),
            coverage: ratio(self.seen.len() as f64, self.total * k),
            avg_list_length: ratio(self.list_length_sum as f64, self.total),
            failures: self.failures,
        }
    }
}

pub struct BlendHarness<'a> {
    recommender: &'a dyn Recommender,
    store: &'a dyn RecStore,
}

impl<'a> BlendHarness<'a> {
    pub fn new(recommender: &'a dyn Recommender, store: &'a dyn RecStore) -> Self {
        Self { recommender, store }
    }

    /// Users with enough recent history, each paired with their latest event.
    pub async fn samples(
        &self,
        ctx: &RequestContext,
        options: &HarnessOptions,
    ) -> AppResult<Vec<HoldoutSample>> {
        let scope = TenantScope::new(ctx.org_id, options.namespace.clone());
        let since = ctx.now - crate::db::days(options.lookback_days);
        Ok(self
            .store
            .holdout_samples(ctx, &scope, since, options.min_events, options.limit)
            .await?)
    }

    /// Scores every candidate against the same samples, in the order supplied.
    pub async fn evaluate(
        &self,
        ctx: &RequestContext,
        options: &HarnessOptions,
        candidates: &[CandidateConfig],
        samples: &[HoldoutSample],
    ) -> AppResult<Vec<EvalResult>> {
        if options.k <= 0 {
            return Err(AppError::InvalidRequest("k must be positive".to_string()));
        }
        for candidate in candidates {
            candidate.validate()?;
        }
        let k = options.k as usize;

        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut tally = Tally::default();
            for sample in samples {
                if ctx.is_canceled() {
                    return Err(AppError::Canceled);
                }
                let request = RecommendRequest {
                    blend: Some(candidate.weights()),
                    as_of: Some(sample.ts),
                    ..RecommendRequest::new(&sample.user_id, &options.namespace, options.k)
                };
                match self.recommender.recommend(ctx, &request).await {
                    Ok((response, _)) => {
                        let list: Vec<String> =
                            response.items.into_iter().map(|i| i.item_id).collect();
                        tally.record(&sample.item_id, &list);
                    }
                    Err(AppError::Canceled) => return Err(AppError::Canceled),
                    Err(err) => {
                        warn!(
                            candidate = %candidate.name,
                            user_id = %sample.user_id,
                            error = %err,
                            "Harness sample failed"
                        );
                        tally.total += 1;
                        tally.failures += 1;
                    }
                }
            }
            let result = tally.finish(&candidate.name, k);
            info!(
                candidate = %result.name,
                hit_rate = result.hit_rate,
                mrr = result.mrr,
                "Evaluated blend candidate"
            );
            results.push(result);
        }
        Ok(results)
    }

    pub async fn run(
        &self,
        ctx: &RequestContext,
        options: &HarnessOptions,
        candidates: &[CandidateConfig],
    ) -> AppResult<Vec<EvalResult>> {
        let samples = self.samples(ctx, options).await?;
        info!(samples = samples.len(), namespace = %options.namespace, "Collected holdout samples");
        self.evaluate(ctx, options, candidates, &samples).await
    }
}

/// Fixed-width table, one row per result in input order.
pub fn format_table(results: &[EvalResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:>7} {:>7} {:>8} {:>8} {:>8} {:>9} {:>8} {:>8}",
        "name", "total", "hits", "hit_rate", "mrr", "avg_rank", "coverage", "avg_len", "failures"
    );
    for r in results {
        let _ = writeln!(
            out,
            "{:<20} {:>7} {:>7} {:>8.4} {:>8.4} {:>8.2} {:>9.4} {:>8.2} {:>8}",
            r.name,
            r.total,
            r.hits,
            r.hit_rate,
            r.mrr,
            r.avg_rank,
            r.coverage,
            r.avg_list_length,
            r.failures
        );
    }
    out
}
