//! Coverage notes for partially verified changes.
//!
//! When every changed region was verified the section renders nothing at
//! all. Otherwise skip reasons are grouped per code with file counts so a
//! reader sees "skipped_external: 2" instead of one row per file.

use std::collections::BTreeMap;

use dioxus::prelude::*;

use vericoach_common::types::{CoverageTelemetry, SkipReason};

/// Group per-file skip reasons into `(reason, file count)` rows, ordered by
/// count descending, then by reason code for a stable tie-break.
pub fn group_skip_reasons(skip_reasons: &BTreeMap<String, SkipReason>) -> Vec<(SkipReason, usize)> {
    let mut counts: BTreeMap<SkipReason, usize> = BTreeMap::new();
    for reason in skip_reasons.values() {
        *counts.entry(*reason).or_insert(0) += 1;
    }
    let mut rows: Vec<(SkipReason, usize)> = counts.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows
}

#[derive(Clone, PartialEq)]
struct CoverageView {
    covered_percent: String,
    rows: Vec<(String, usize)>,
}

#[component]
fn CoverageNotes(view: CoverageView) -> Element {
    rsx! {
        div { class: "coverage-notes border border-amber-200 bg-amber-50 rounded-lg p-4 mb-3",
            div { class: "flex justify-between items-center",
                span { class: "font-semibold text-amber-800", "Coverage notes" }
                span { class: "text-sm text-amber-700", "{view.covered_percent}% of changed code verified" }
            }
            ul { class: "mt-2 text-sm text-amber-700 list-disc pl-5",
                for (code, count) in view.rows.iter() {
                    li { "{code}: {count}" }
                }
            }
        }
    }
}

/// Render the coverage section, or an empty string when nothing was skipped
/// and the changed code is fully covered.
pub fn render_coverage_notes(coverage: &CoverageTelemetry) -> String {
    if coverage.fully_covered_percent_of_changed >= 100.0 && coverage.skip_reasons.is_empty() {
        return String::new();
    }

    let view = CoverageView {
        covered_percent: format!("{:.0}", coverage.fully_covered_percent_of_changed),
        rows: group_skip_reasons(&coverage.skip_reasons)
            .into_iter()
            .map(|(reason, count)| (reason.as_str().to_string(), count))
            .collect(),
    };
    let mut dom = VirtualDom::new_with_props(CoverageNotes, CoverageNotesProps { view });
    dom.rebuild_in_place();
    dioxus::ssr::render(&dom)
}
