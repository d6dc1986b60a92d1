//! Full run report assembled from the session snapshot.

use vericoach_client::SessionState;
use vericoach_common::types::ConsensusResult;

use super::coverage::render_coverage_notes;
use super::diagnostics::render_diagnostics_strip;
use super::judges::{judge_to_view, render_judge_cards};

fn consensus_header(consensus: &ConsensusResult) -> String {
    let mut header = format!(
        "<div class=\"consensus-header\"><h2>{}</h2><p>weighted score {:.2} · invariants {}/{}</p>",
        consensus.overall_status,
        consensus.weighted_score,
        consensus.invariants_passed,
        consensus.invariants_checked,
    );
    if consensus.veto_triggered {
        let reason = consensus.veto_reason.as_deref().unwrap_or("no reason given");
        header.push_str(&format!("<p class=\"veto-reason\">veto: {reason}</p>"));
    }
    header.push_str("</div>");
    header
}

/// Render the whole report for the current session snapshot. Judge cards
/// render expanded here; the report is the post-run artifact, not the live
/// dashboard.
pub fn render_report(state: &SessionState) -> String {
    let Some(verdict) = state.verdict.as_ref() else {
        return match state.fatal.as_deref() {
            Some(message) => format!("<p class=\"run-error\">{message}</p>"),
            None => "<p class=\"run-pending\">no verdict available yet</p>".to_string(),
        };
    };

    let mut sections = Vec::new();
    if let Some(consensus) = verdict.consensus.as_ref() {
        sections.push(consensus_header(consensus));
        let cards = consensus
            .judges
            .iter()
            .map(|judge| judge_to_view(judge, true))
            .collect();
        sections.push(render_judge_cards(cards));
    }
    if let Some(coverage) = verdict.telemetry.as_ref().and_then(|t| t.coverage.as_ref()) {
        let notes = render_coverage_notes(coverage);
        if !notes.is_empty() {
            sections.push(notes);
        }
    }
    sections.push(render_diagnostics_strip(verdict.telemetry.as_ref()));
    sections.join("\n")
}
