use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ProbeContext, ProbeOutcome, ProbeResult, ProofReport, ScoreWeights};
use crate::config::ProbeConfig;
use crate::error::CoreError;

/// One independent, read-only check.
///
/// A returned `Err`, a panic, or overrunning the board's timeout all
/// become an `error` step; none of them affect other probes.
pub trait Probe: Send + Sync {
    /// Stable identifier, e.g. `"peers"`.
    fn id(&self) -> &str;

    /// Human-readable label.
    fn label(&self) -> &str;

    fn run<'a>(&'a self, ctx: &'a ProbeContext) -> BoxFuture<'a, Result<ProbeOutcome, CoreError>>;
}

/// Ordered set of probes with a shared per-probe deadline.
#[derive(Clone)]
pub struct ProbeBoard {
    probes: Vec<Arc<dyn Probe>>,
    timeout: Duration,
    weights: ScoreWeights,
}

impl ProbeBoard {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            probes: Vec::new(),
            timeout: config.timeout,
            weights: config.weights,
        }
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_probe(mut self, probe: impl Probe + 'static) -> Self {
        self.register(probe);
        self
    }

    pub fn register(&mut self, probe: impl Probe + 'static) {
        self.probes.push(Arc::new(probe));
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Probe ids in declaration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.probes.iter().map(|p| p.id())
    }

    /// Run every probe concurrently and aggregate. Always returns a full
    /// report, one step per probe, in declaration order.
    pub async fn run(&self, ctx: &ProbeContext) -> ProofReport {
        let started_at = Utc::now();
        let started = Instant::now();

        let steps = join_all(
            self.probes
                .iter()
                .map(|probe| run_one(probe.as_ref(), ctx, self.timeout)),
        )
        .await;

        let report = ProofReport::new(started_at, elapsed_ms(started), steps, &self.weights);
        info!(
            probes = report.steps.len(),
            score = report.summary_score,
            duration_ms = report.duration_ms,
            "Probe run finished"
        );
        report
    }
}

async fn run_one(probe: &dyn Probe, ctx: &ProbeContext, timeout: Duration) -> ProbeResult {
    let started = Instant::now();
    let guarded = AssertUnwindSafe(probe.run(ctx)).catch_unwind();

    let outcome = match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(Ok(outcome))) => outcome,
        Ok(Ok(Err(e))) => {
            warn!(probe = probe.id(), error = %e, "Probe failed");
            ProbeOutcome::error(json!({ "error": e.to_string() }))
        }
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            warn!(probe = probe.id(), %message, "Probe panicked");
            ProbeOutcome::error(json!({ "error": message }))
        }
        Err(_) => {
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(probe = probe.id(), timeout_ms, "Probe timed out");
            ProbeOutcome::error(json!({ "error": format!("timed out after {timeout_ms}ms") }))
        }
    };

    let duration_ms = elapsed_ms(started);
    debug!(probe = probe.id(), status = %outcome.status, duration_ms, "Probe step");
    ProbeResult {
        id: probe.id().to_owned(),
        label: probe.label().to_owned(),
        status: outcome.status,
        duration_ms,
        data: outcome.data,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("probe panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("probe panicked: {s}")
    } else {
        "probe panicked".to_owned()
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
