use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use recsys_api::config::{Config, EngineConfig};
use recsys_api::context::RequestContext;
use recsys_api::db::{create_pool, PgRecStore};
use recsys_api::services::harness::format_table;
use recsys_api::services::{BlendHarness, CandidateConfig, Engine, HarnessOptions};

/// Score blend weight candidates against each user's most recent event
#[derive(Debug, Parser)]
#[command(name = "blend-eval", version)]
struct Args {
    /// Organization id
    #[arg(long)]
    org: Uuid,

    #[arg(long)]
    namespace: String,

    /// JSON file holding an array of {name, alpha, beta, gamma}
    #[arg(long)]
    candidates: PathBuf,

    #[arg(long, default_value_t = 20)]
    k: i64,

    /// Maximum number of sampled users
    #[arg(long, default_value_t = 200)]
    limit: usize,

    #[arg(long, default_value_t = 5)]
    min_events: usize,

    #[arg(long, default_value_t = 30.0)]
    lookback_days: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("recsys_api=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.candidates)
        .with_context(|| format!("reading {}", args.candidates.display()))?;
    let candidates: Vec<CandidateConfig> =
        serde_json::from_str(&raw).context("parsing candidate list")?;
    if candidates.is_empty() {
        anyhow::bail!("candidate list is empty");
    }
    for candidate in &candidates {
        candidate.validate()?;
    }

    let config = Config::from_env()?;
    let engine_config = Arc::new(EngineConfig::from_env()?);
    let pool = create_pool(&config).await?;
    let store = Arc::new(PgRecStore::new(pool, config.store_options()));
    let engine = Engine::new(engine_config, store.clone());

    let options = HarnessOptions {
        namespace: args.namespace,
        k: args.k,
        limit: args.limit,
        min_events: args.min_events,
        lookback_days: args.lookback_days,
    };
    let ctx = RequestContext::new(args.org);
    let results = BlendHarness::new(&engine, store.as_ref())
        .run(&ctx, &options, &candidates)
        .await?;

    print!("{}", format_table(&results));
    Ok(())
}
