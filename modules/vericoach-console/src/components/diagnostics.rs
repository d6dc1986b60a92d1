//! Diagnostics strip: one compact line of run telemetry.
//!
//! Coverage percentage, routing lane, cache signal and latency spread, each
//! rendered only when the backend attached that section.

use dioxus::prelude::*;

use vericoach_common::types::{CacheSignal, Telemetry};

#[derive(Debug, Clone, PartialEq)]
pub struct LatencySummary {
    pub min: f64,
    pub median: f64,
    pub max: f64,
}

/// Min/median/max over a latency series. Empty series yields `None`.
/// For an even count the median is the lower of the two central values,
/// which keeps the summary a real observed latency.
pub fn latency_summary(samples: &[f64]) -> Option<LatencySummary> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(LatencySummary {
        min: sorted[0],
        median: sorted[(sorted.len() - 1) / 2],
        max: sorted[sorted.len() - 1],
    })
}

#[derive(Clone, PartialEq, Default)]
struct DiagnosticsView {
    coverage: Option<String>,
    route: Option<String>,
    fallback_used: bool,
    cache: Option<String>,
    latency: Option<String>,
}

fn telemetry_to_view(telemetry: &Telemetry) -> DiagnosticsView {
    let coverage = telemetry
        .coverage
        .as_ref()
        .map(|c| format!("coverage {:.0}%", c.fully_covered_percent_of_changed));
    let route = telemetry
        .router
        .as_ref()
        .map(|r| format!("{} · {}/{}", r.lane, r.provider, r.model));
    let fallback_used = telemetry
        .router
        .as_ref()
        .map(|r| !r.fallback_chain.is_empty())
        .unwrap_or(false);
    let cache = telemetry.cache.as_ref().map(|c| {
        let signal = match c.signal {
            CacheSignal::Hit => "cache hit",
            CacheSignal::Miss => "cache miss",
            CacheSignal::Unknown => "cache ?",
        };
        match c.intent.as_deref() {
            Some(intent) => format!("{signal} ({intent})"),
            None => signal.to_string(),
        }
    });
    let latency = telemetry
        .latency
        .as_ref()
        .and_then(|l| latency_summary(&l.item_latency_ms))
        .map(|s| {
            format!(
                "latency {:.0}/{:.0}/{:.0} ms",
                s.min, s.median, s.max
            )
        });
    DiagnosticsView {
        coverage,
        route,
        fallback_used,
        cache,
        latency,
    }
}

#[component]
fn DiagnosticsStrip(view: DiagnosticsView) -> Element {
    rsx! {
        div { class: "diagnostics-strip flex gap-4 text-xs text-gray-500 border-t border-gray-100 pt-2",
            if let Some(coverage) = view.coverage.as_ref() {
                span { "{coverage}" }
            }
            if let Some(route) = view.route.as_ref() {
                span {
                    "{route}"
                    if view.fallback_used {
                        span { class: "text-amber-600 ml-1", "(fallback used)" }
                    }
                }
            }
            if let Some(cache) = view.cache.as_ref() {
                span { "{cache}" }
            }
            if let Some(latency) = view.latency.as_ref() {
                span { "{latency}" }
            }
        }
    }
}

#[component]
fn DiagnosticsPlaceholder() -> Element {
    rsx! {
        div { class: "diagnostics-strip text-xs text-gray-400 border-t border-gray-100 pt-2",
            span { "no telemetry reported" }
        }
    }
}

pub fn render_diagnostics_strip(telemetry: Option<&Telemetry>) -> String {
    let mut dom = match telemetry {
        Some(telemetry) => VirtualDom::new_with_props(
            DiagnosticsStrip,
            DiagnosticsStripProps {
                view: telemetry_to_view(telemetry),
            },
        ),
        None => VirtualDom::new(DiagnosticsPlaceholder),
    };
    dom.rebuild_in_place();
    dioxus::ssr::render(&dom)
}
