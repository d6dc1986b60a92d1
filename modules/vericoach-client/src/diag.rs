//! Structured diagnostics for the channel and session controller.
//!
//! Connectivity churn and absorbed failures never reach the user as state
//! changes, but they still need to be observable. Both components emit
//! typed events through an injected sink so tests assert on events instead
//! of scraping log lines.

use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::merge::UpdateSource;

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    ChannelConnected {
        run_id: String,
        attempt: u32,
    },
    ChannelReconnectScheduled {
        run_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    ChannelGaveUp {
        run_id: String,
        attempts: u32,
    },
    ChannelAuthMissing {
        run_id: String,
    },
    /// A frame arrived that cannot be applied: unparseable, or scoped to a
    /// run id other than the active one.
    FrameDropped {
        run_id: String,
        reason: String,
    },
    PollFailed {
        run_id: String,
        consecutive: u32,
        message: String,
    },
    /// The merge rule refused an update that would regress run state.
    StaleUpdateIgnored {
        run_id: String,
        source: UpdateSource,
    },
    CancelRequested {
        run_id: String,
        accepted: bool,
    },
}

pub trait DiagnosticSink: Send + Sync {
    fn record(&self, event: DiagnosticEvent);
}

/// Default sink: forwards to `tracing` at a severity matching the event.
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, event: DiagnosticEvent) {
        match &event {
            DiagnosticEvent::ChannelConnected { run_id, attempt } => {
                info!(run_id, attempt, "Live channel connected");
            }
            DiagnosticEvent::ChannelReconnectScheduled { run_id, attempt, delay_ms } => {
                info!(run_id, attempt, delay_ms, "Live channel reconnect scheduled");
            }
            DiagnosticEvent::ChannelGaveUp { run_id, attempts } => {
                warn!(run_id, attempts, "Live channel gave up reconnecting");
            }
            DiagnosticEvent::ChannelAuthMissing { run_id } => {
                warn!(run_id, "No channel token in production mode; not connecting");
            }
            DiagnosticEvent::FrameDropped { run_id, reason } => {
                debug!(run_id, reason = reason.as_str(), "Dropped channel frame");
            }
            DiagnosticEvent::PollFailed { run_id, consecutive, message } => {
                warn!(run_id, consecutive, message = message.as_str(), "Status poll failed");
            }
            DiagnosticEvent::StaleUpdateIgnored { run_id, source } => {
                debug!(run_id, source = ?source, "Ignored stale run update");
            }
            DiagnosticEvent::CancelRequested { run_id, accepted } => {
                info!(run_id, accepted, "Cancel requested");
            }
        }
    }
}

/// Test sink: records every event for later assertion.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn record(&self, event: DiagnosticEvent) {
        self.events.lock().unwrap().push(event);
    }
}
