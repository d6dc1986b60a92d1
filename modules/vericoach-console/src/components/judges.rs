//! Judge verdict cards.
//!
//! One card per judge. Collapsed cards show role, model, status and score;
//! the explanation and issue list only render when the card is expanded.
//! Veto verdicts carry the stable `verdict-veto` class so they can be
//! located independently of styling.

use dioxus::prelude::*;

use vericoach_common::types::{JudgeIssue, JudgeVerdict, VerdictStatus};

#[derive(Clone, PartialEq)]
pub struct IssueRow {
    pub severity: String,
    pub description: String,
    pub location: Option<String>,
}

#[derive(Clone, PartialEq)]
pub struct JudgeCardView {
    pub role: String,
    pub model: String,
    pub status: String,
    pub veto: bool,
    pub score: String,
    pub confidence: String,
    pub explanation: String,
    pub issues: Vec<IssueRow>,
    pub suggestions: Vec<String>,
    /// Expansion is caller-owned UI state, not verdict data.
    pub expanded: bool,
}

fn issue_to_row(issue: &JudgeIssue) -> IssueRow {
    let location = issue.file.as_ref().map(|f| match issue.line {
        Some(line) => format!("{f}:{line}"),
        None => f.clone(),
    });
    IssueRow {
        severity: format!("{:?}", issue.severity).to_lowercase(),
        description: issue.description.clone(),
        location,
    }
}

pub fn judge_to_view(verdict: &JudgeVerdict, expanded: bool) -> JudgeCardView {
    JudgeCardView {
        role: verdict.role.clone(),
        model: verdict.model.clone(),
        status: verdict.status.to_string(),
        veto: verdict.status == VerdictStatus::Veto,
        score: format!("{:.2}", verdict.score),
        confidence: format!("{:.0}%", verdict.confidence * 100.0),
        explanation: verdict.explanation.clone(),
        issues: verdict.issues.iter().map(issue_to_row).collect(),
        suggestions: verdict.suggestions.clone(),
        expanded,
    }
}

fn judge_card(view: &JudgeCardView) -> Element {
    let card_class = if view.veto {
        "judge-card verdict-veto border-red-400 bg-red-50"
    } else {
        "judge-card border-gray-200 bg-white"
    };
    let status_class = if view.veto {
        "font-bold text-red-700 uppercase"
    } else {
        "font-semibold text-gray-700"
    };

    rsx! {
        div { class: "{card_class} border rounded-lg p-4 mb-3",
            div { class: "flex justify-between items-center",
                div {
                    span { class: "font-semibold mr-2", "{view.role}" }
                    span { class: "text-xs text-gray-400", "{view.model}" }
                }
                div {
                    span { class: "{status_class} mr-3", "{view.status}" }
                    span { class: "text-sm text-gray-500", "score {view.score} · conf {view.confidence}" }
                }
            }
            if view.expanded {
                div { class: "judge-explanation mt-3 text-sm text-gray-600",
                    p { "{view.explanation}" }
                    if !view.issues.is_empty() {
                        ul { class: "mt-2 list-disc pl-5",
                            for issue in view.issues.iter() {
                                li {
                                    span { class: "font-semibold mr-1", "[{issue.severity}]" }
                                    "{issue.description}"
                                    if let Some(loc) = issue.location.as_ref() {
                                        span { class: "text-gray-400 ml-1", "({loc})" }
                                    }
                                }
                            }
                        }
                    }
                    if !view.suggestions.is_empty() {
                        ul { class: "mt-2 list-disc pl-5 text-gray-500",
                            for suggestion in view.suggestions.iter() {
                                li { "{suggestion}" }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[component]
fn JudgeCards(cards: Vec<JudgeCardView>) -> Element {
    rsx! {
        div { class: "judge-cards",
            for card in cards.iter() {
                { judge_card(card) }
            }
        }
    }
}

pub fn render_judge_cards(cards: Vec<JudgeCardView>) -> String {
    let mut dom = VirtualDom::new_with_props(JudgeCards, JudgeCardsProps { cards });
    dom.rebuild_in_place();
    dioxus::ssr::render(&dom)
}
