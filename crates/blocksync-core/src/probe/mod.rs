// ── Probe aggregation ──
//
// A probe is one independent, read-only health check. `ProbeBoard` runs
// every registered probe concurrently and reduces the results to a
// `ProofReport` with a single 0..=100 score.

mod board;
pub mod probes;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

pub use board::{Probe, ProbeBoard};
pub use probes::{FileHint, ProbeContext};

/// Outcome class of a single probe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Warn,
    Error,
    Pending,
    Skipped,
}

/// What a probe body returns; the board adds identity and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub data: Value,
}

impl ProbeOutcome {
    pub fn new(status: ProbeStatus, data: Value) -> Self {
        Self { status, data }
    }

    pub fn ok(data: Value) -> Self {
        Self::new(ProbeStatus::Ok, data)
    }

    pub fn warn(data: Value) -> Self {
        Self::new(ProbeStatus::Warn, data)
    }

    pub fn error(data: Value) -> Self {
        Self::new(ProbeStatus::Error, data)
    }

    pub fn skipped(data: Value) -> Self {
        Self::new(ProbeStatus::Skipped, data)
    }
}

/// One finished step of a report. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: String,
    pub label: String,
    pub status: ProbeStatus,
    pub duration_ms: u64,
    pub data: Value,
}

/// Aggregate of one board run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub summary_score: u8,
    /// In board declaration order.
    pub steps: Vec<ProbeResult>,
}

impl ProofReport {
    pub fn new(
        started_at: DateTime<Utc>,
        duration_ms: u64,
        steps: Vec<ProbeResult>,
        weights: &ScoreWeights,
    ) -> Self {
        Self {
            started_at,
            duration_ms,
            summary_score: summary_score(&steps, weights),
            steps,
        }
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&ProbeResult> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ── Scoring ──────────────────────────────────────────────────────────

/// Per-status penalty subtracted from a perfect 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub error: u32,
    pub warn: u32,
    pub pending: u32,
    pub skipped: u32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            error: 15,
            warn: 7,
            pending: 0,
            skipped: 0,
        }
    }
}

impl ScoreWeights {
    pub fn penalty(&self, status: ProbeStatus) -> u32 {
        match status {
            ProbeStatus::Ok => 0,
            ProbeStatus::Warn => self.warn,
            ProbeStatus::Error => self.error,
            ProbeStatus::Pending => self.pending,
            ProbeStatus::Skipped => self.skipped,
        }
    }
}

/// `clamp(100 - Σ penalty(status), 0, 100)`. Order-independent.
pub fn summary_score(steps: &[ProbeResult], weights: &ScoreWeights) -> u8 {
    let penalty = steps
        .iter()
        .map(|step| weights.penalty(step.status))
        .fold(0_u32, u32::saturating_add);
    u8::try_from(100_u32.saturating_sub(penalty)).unwrap_or(0)
}
