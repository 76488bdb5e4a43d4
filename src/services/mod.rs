pub mod blender;
pub mod diversity;
pub mod engine;
pub mod explain;
pub mod harness;
pub mod metrics;
pub mod policy;
pub mod rules;
pub mod signals;

pub use engine::{Engine, Recommender};
pub use harness::{BlendHarness, CandidateConfig, EvalResult, HarnessOptions};
pub use metrics::{NoopObserver, PolicyMetrics, PolicyObserver};
