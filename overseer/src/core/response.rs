//! Planner response parsing.
//!
//! Responses are free text that may or may not embed a JSON decision. Parsing
//! runs an ordered chain and stops at the first step that yields a verdict:
//!
//! 1. exact keyword (`MISSION_COMPLETED` / `MISSION_FAILED`)
//! 2. fenced ```json block
//! 3. first balanced `{...}` object in the text
//! 4. the raw text as a command

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::types::PlannerDecision;

pub const COMPLETED_KEYWORD: &str = "MISSION_COMPLETED";
pub const FAILED_KEYWORD: &str = "MISSION_FAILED";

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("think regex"));
static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("fenced json regex")
});

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Remove `<think>...</think>` reasoning blocks and surrounding whitespace.
pub fn strip_think(text: &str) -> String {
    THINK_RE.replace_all(text, "").trim().to_string()
}

/// Parse a planner reply into a decision.
pub fn parse_decision(raw: &str) -> PlannerDecision {
    let text = strip_think(raw);
    if let Some(decision) = keyword_decision(&text) {
        return decision;
    }
    if let Some(decision) = fenced_decision(&text) {
        return decision;
    }
    if let Some(decision) = bracket_decision(&text) {
        return decision;
    }
    PlannerDecision::Command(text)
}

fn keyword_decision(text: &str) -> Option<PlannerDecision> {
    if let Some(idx) = text.find(FAILED_KEYWORD) {
        let reason = text[idx + FAILED_KEYWORD.len()..]
            .trim_start_matches([':', ' '])
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let reason = if reason.is_empty() {
            "planner reported failure".to_string()
        } else {
            reason
        };
        return Some(PlannerDecision::Failed(reason));
    }
    if text.contains(COMPLETED_KEYWORD) {
        return Some(PlannerDecision::Completed);
    }
    None
}

fn fenced_decision(text: &str) -> Option<PlannerDecision> {
    let caps = FENCED_RE.captures(text)?;
    let body = caps.get(1)?.as_str();
    decision_from_json(body)
}

fn bracket_decision(text: &str) -> Option<PlannerDecision> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find('{') {
        let start = search_from + rel;
        if let Some(end) = balanced_end(text, start)
            && let Some(decision) = decision_from_json(&text[start..=end])
        {
            return Some(decision);
        }
        search_from = start + 1;
    }
    None
}

/// Index of the `}` closing the object opened at `start`, honoring strings.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn decision_from_json(body: &str) -> Option<PlannerDecision> {
    let raw: RawDecision = serde_json::from_str(body).ok()?;
    let status = raw
        .status
        .as_deref()
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if status == "completed" || status == "complete" || status == "done" {
        return Some(PlannerDecision::Completed);
    }
    if status == "failed" {
        let reason = raw
            .command
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| "planner reported failure".to_string());
        return Some(PlannerDecision::Failed(reason));
    }
    let command = raw.command?.trim().to_string();
    if command.is_empty() {
        return None;
    }
    Some(PlannerDecision::Command(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_completion_wins_over_json() {
        let raw = "All done. MISSION_COMPLETED\n```json\n{\"command\":\"ls\"}\n```";
        assert_eq!(parse_decision(raw), PlannerDecision::Completed);
    }

    #[test]
    fn failure_keyword_carries_reason() {
        let raw = "MISSION_FAILED: cannot find the repo";
        assert_eq!(
            parse_decision(raw),
            PlannerDecision::Failed("cannot find the repo".to_string())
        );
    }

    #[test]
    fn fenced_json_command_is_extracted() {
        let raw = "Next step:\n```json\n{\"command\": \"cat src/main.rs\", \"status\": \"continue\"}\n```";
        assert_eq!(
            parse_decision(raw),
            PlannerDecision::Command("cat src/main.rs".to_string())
        );
    }

    /// Verifies status matching is case-insensitive in structured output.
    #[test]
    fn fenced_json_completed_status() {
        let raw = "```\n{\"command\": \"\", \"status\": \"Completed\"}\n```";
        assert_eq!(parse_decision(raw), PlannerDecision::Completed);
    }

    #[test]
    fn bare_object_is_extracted_with_nested_braces() {
        let raw = "I think {\"command\": \"echo '{x}'\", \"status\": \"continue\"} is next";
        assert_eq!(
            parse_decision(raw),
            PlannerDecision::Command("echo '{x}'".to_string())
        );
    }

    #[test]
    fn think_blocks_are_ignored() {
        let raw = "<think>maybe MISSION_COMPLETED?</think>\nRun the tests";
        assert_eq!(
            parse_decision(raw),
            PlannerDecision::Command("Run the tests".to_string())
        );
    }

    /// Verifies unparseable text falls through to the raw command.
    #[test]
    fn raw_text_is_the_last_resort() {
        let raw = "Write a README with {broken json";
        assert_eq!(
            parse_decision(raw),
            PlannerDecision::Command("Write a README with {broken json".to_string())
        );
    }
}
