use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Run Lifecycle ---

/// Backend-reported run status. `Unknown` preserves statuses introduced by
/// newer backends so a stale client degrades instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Complete,
    Error,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Terminal statuses never transition again for the same run id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable lifecycle view of a run, as reported by status polls and
/// channel events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    #[serde(default)]
    pub current_phase: Option<String>,
    /// Percent in [0, 100]; the producer clamps, the client never recomputes.
    #[serde(default)]
    pub progress_percent: f32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunState {
    pub fn queued() -> Self {
        Self {
            status: RunStatus::Queued,
            current_phase: None,
            progress_percent: 0.0,
            message: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// One row in the run history list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

// --- Verdicts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Fail,
    Veto,
    Abstain,
}

impl VerdictStatus {
    pub fn is_failing(&self) -> bool {
        matches!(self, Self::Fail | Self::Veto)
    }
}

impl std::fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Veto => write!(f, "veto"),
            Self::Abstain => write!(f, "abstain"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A concrete problem one judge found, optionally pinned to a location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeIssue {
    pub severity: IssueSeverity,
    pub description: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// One evaluation role's verdict on the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    /// Role name, e.g. "architect", "security", "user-proxy".
    pub role: String,
    pub model: String,
    pub status: VerdictStatus,
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub issues: Vec<JudgeIssue>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Aggregated result across all judges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub overall_status: VerdictStatus,
    pub weighted_score: f64,
    pub veto_triggered: bool,
    #[serde(default)]
    pub veto_reason: Option<String>,
    pub invariants_checked: u32,
    pub invariants_passed: u32,
    pub judges: Vec<JudgeVerdict>,
}

impl ConsensusResult {
    /// A veto must fail the consensus and be traceable to at least one
    /// vetoing judge.
    pub fn is_consistent(&self) -> bool {
        if !self.veto_triggered {
            return true;
        }
        self.overall_status.is_failing()
            && self.judges.iter().any(|j| j.status == VerdictStatus::Veto)
    }
}

/// A proposed unified-diff code change. The diff text and the content pair
/// are kept consistent by the backend; the client only renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub file_path: String,
    pub original_content: String,
    pub patched_content: String,
    pub unified_diff: String,
    #[serde(default)]
    pub issue_refs: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub needs_human_review: bool,
}

// --- Telemetry ---

/// Why a changed file was left out of coverage analysis. Closed set; the
/// backend never invents codes outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    SkippedExternal,
    SkippedMissing,
    SkippedBinary,
    SkippedGenerated,
    SkippedUnsupported,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkippedExternal => "skipped_external",
            Self::SkippedMissing => "skipped_missing",
            Self::SkippedBinary => "skipped_binary",
            Self::SkippedGenerated => "skipped_generated",
            Self::SkippedUnsupported => "skipped_unsupported",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageTelemetry {
    pub fully_covered_percent_of_changed: f64,
    pub changed_files: u32,
    pub covered_files: u32,
    /// File path -> reason it was skipped. BTreeMap keeps iteration stable
    /// for display tie-breaking.
    #[serde(default)]
    pub skip_reasons: BTreeMap<String, SkipReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterTelemetry {
    pub lane: String,
    pub provider: String,
    pub model: String,
    /// Providers tried before the one that served the request.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSignal {
    Hit,
    Miss,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTelemetry {
    #[serde(default)]
    pub intent: Option<String>,
    pub signal: CacheSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyTelemetry {
    pub batch_size: u32,
    pub batch_mode: String,
    /// Per-item latency series, milliseconds.
    #[serde(default)]
    pub item_latency_ms: Vec<f64>,
}

/// Run-level diagnostic metadata, separate from the verdict itself.
/// Every section is optional; the backend attaches what it measured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default)]
    pub coverage: Option<CoverageTelemetry>,
    #[serde(default)]
    pub router: Option<RouterTelemetry>,
    #[serde(default)]
    pub cache: Option<CacheTelemetry>,
    #[serde(default)]
    pub latency: Option<LatencyTelemetry>,
}
