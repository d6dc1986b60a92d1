//! Presentation adapters for the verification coach console.
//!
//! Pure transforms from run/verdict/telemetry data to server-side rendered
//! views. No state lives here; every component renders whatever snapshot
//! it is handed.

pub mod components;
pub mod templates;

pub use components::{
    coverage::{group_skip_reasons, render_coverage_notes},
    diagnostics::{latency_summary, render_diagnostics_strip, LatencySummary},
    judges::{judge_to_view, render_judge_cards, JudgeCardView},
    report::render_report,
};
pub use templates::render_page;
