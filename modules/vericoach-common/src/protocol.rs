//! Wire contract between the console and the verification backend.
//!
//! Two surfaces share these types: the REST run API (start/status/verdict/
//! prompt/cancel/list/upload) and the live event channel. Channel frames are
//! tagged on `type`; the tag in serde is the wire tag, nothing re-maps it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConsensusResult, Patch, RunState, RunStatus, RunSummary, Telemetry};

// --- Run Targets ---

/// What a run verifies. Produced by the upload or repository-import flows,
/// which are outside this client; the controller only validates that a
/// non-empty path arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTarget {
    /// A previously uploaded file set, addressed by its server-side path.
    Upload { path: String },
    /// An imported repository path on the backend.
    Repository { path: String },
}

impl RunTarget {
    pub fn path(&self) -> &str {
        match self {
            Self::Upload { path } | Self::Repository { path } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StartOptions {
    #[serde(default)]
    pub generate_patches: bool,
    #[serde(default)]
    pub watch: bool,
}

// --- REST Bodies ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub target: RunTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_path: Option<String>,
    #[serde(default)]
    pub options: StartOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub run_id: String,
    pub state: RunState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictResponse {
    pub run_id: String,
    #[serde(default)]
    pub consensus: Option<ConsensusResult>,
    #[serde(default)]
    pub patches: Vec<Patch>,
    /// False until the pipeline has finished aggregating.
    pub ready: bool,
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
    #[serde(default)]
    pub report_markdown: Option<String>,
    #[serde(default)]
    pub patch_diff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResponse {
    pub run_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub runs: Vec<RunSummary>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// One multipart batch acknowledged. `upload_id` from the first batch must
/// be echoed on every later batch so the backend assembles one file set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatchResponse {
    pub path: String,
    pub count: u32,
    pub upload_id: String,
}

/// Short-lived, run-scoped token for the live channel (production only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelTokenResponse {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

// --- Live Channel Frames ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default)]
    pub phase: Option<String>,
    pub progress_percent: f32,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelErrorPayload {
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// One frame on the live channel. The `type` tag discriminates the payload
/// shape; unsafe cross-variant field access is impossible by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Status {
        run_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        data: RunState,
    },
    Progress {
        run_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        data: ProgressUpdate,
    },
    Verdict {
        run_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        data: VerdictResponse,
    },
    Error {
        run_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        data: ChannelErrorPayload,
    },
    Ping {
        #[serde(default)]
        run_id: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Pong {
        #[serde(default)]
        run_id: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl ChannelMessage {
    /// Run id the frame is scoped to, if any. Heartbeats may omit it.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::Status { run_id, .. }
            | Self::Progress { run_id, .. }
            | Self::Verdict { run_id, .. }
            | Self::Error { run_id, .. } => Some(run_id),
            Self::Ping { run_id, .. } | Self::Pong { run_id, .. } => run_id.as_deref(),
        }
    }

    /// Heartbeats are consumed inside the channel and never multicast.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Ping { .. } | Self::Pong { .. })
    }
}
