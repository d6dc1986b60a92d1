//! Monotonic merge of run-state updates.
//!
//! The channel and the poll loop race; neither source's ordering can be
//! trusted, so every incoming update passes through one pure rule: state
//! only moves forward. A stale poll reporting `running` after the channel
//! already delivered `complete` is ignored, not applied.

use vericoach_common::types::{RunState, RunStatus};

/// Where an update came from. Recorded for diagnostics only; the merge
/// rule itself is source-blind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Start,
    Channel,
    Poll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Applied(RunState),
    /// The update would regress an already more-advanced state.
    Ignored,
}

/// How far along the lifecycle a status is. Terminal states outrank
/// everything; `Unknown` ranks with `Queued` so a stale or garbled status
/// can never push state forward on its own.
fn rank(status: &RunStatus) -> u8 {
    match status {
        RunStatus::Queued | RunStatus::Unknown => 0,
        RunStatus::Running => 1,
        RunStatus::Complete | RunStatus::Error | RunStatus::Cancelled => 2,
    }
}

/// Merge `incoming` into `current`, enforcing monotonic progress.
///
/// Rules, in order:
/// - a terminal `current` is immutable; everything after it is ignored
/// - a terminal `incoming` wins, picking up `started_at` from `current`
///   when the final report omits it
/// - between non-terminal states, a lower-ranked `incoming` is ignored;
///   otherwise the newest arrival wins field-by-field, except
///   `progress_percent` which never decreases
pub fn merge(current: &RunState, incoming: &RunState, _source: UpdateSource) -> MergeOutcome {
    if current.status.is_terminal() {
        return MergeOutcome::Ignored;
    }

    if incoming.status.is_terminal() {
        let mut merged = incoming.clone();
        merged.progress_percent = merged.progress_percent.max(current.progress_percent);
        if merged.started_at.is_none() {
            merged.started_at = current.started_at;
        }
        return MergeOutcome::Applied(merged);
    }

    if rank(&incoming.status) < rank(&current.status) {
        return MergeOutcome::Ignored;
    }

    let mut merged = incoming.clone();
    merged.progress_percent = merged.progress_percent.max(current.progress_percent);
    if merged.current_phase.is_none() {
        merged.current_phase = current.current_phase.clone();
    }
    if merged.message.is_none() {
        merged.message = current.message.clone();
    }
    if merged.started_at.is_none() {
        merged.started_at = current.started_at;
    }
    MergeOutcome::Applied(merged)
}
