//! Canary Custom Resource Definition and supporting types

mod analysis;
mod canary;

pub use analysis::{
    CanaryAnalysis, CanaryWebhook, MetricCheck, RequestMatch, StringMatch,
};
pub use canary::{
    Canary, CanaryPhase, CanaryService, CanarySpec, CanaryStatus, TargetRef,
    DEFAULT_ANALYSIS_INTERVAL,
};
