//! Bounded prompt history.
//!
//! Older transcript segments collapse into an "execution path" trail of the
//! commands they issued; the task statement and the most recent segments stay
//! verbatim. Text already within budget is returned unchanged, so compressing
//! twice is a no-op.

use crate::core::transcript::{
    self, EXECUTION_PATH, PLANNER, Segment, TASK, parse_segments, render_segment,
};

pub const COMPRESSED_MARKER: &str = "...compressed...";
pub const TRIM_MARKER: &str = "\n...[context trimmed]...\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionBudget {
    pub max_chars: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
    pub recent_segments: usize,
    pub max_path_entries: usize,
}

impl Default for CompressionBudget {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            head_chars: 800,
            tail_chars: 2000,
            recent_segments: 3,
            max_path_entries: 12,
        }
    }
}

/// Compress a transcript to fit `budget.max_chars`.
pub fn compress_history(history: &str, budget: &CompressionBudget) -> String {
    if char_len(history) <= budget.max_chars {
        return history.to_string();
    }

    let (preamble, segments) = parse_segments(history);
    let mut header = Vec::new();
    let mut trail = Vec::new();
    let mut rest: Vec<Segment> = Vec::new();
    for segment in segments {
        match segment.label.as_str() {
            TASK => header.push(segment),
            EXECUTION_PATH => trail.extend(path_entries(&segment.body)),
            _ => rest.push(segment),
        }
    }

    let split = rest.len().saturating_sub(budget.recent_segments);
    let (older, recent) = rest.split_at(split);
    for segment in older {
        trail.extend(segment_commands(segment));
    }
    trail.dedup();
    if trail.len() > budget.max_path_entries {
        trail.drain(..trail.len() - budget.max_path_entries);
    }

    let mut out = String::new();
    if !preamble.is_empty() {
        out.push_str(&preamble);
        out.push('\n');
    }
    for segment in &header {
        out.push_str(&segment.render());
    }
    if !trail.is_empty() {
        let body = trail
            .iter()
            .map(|cmd| format!("- {cmd}"))
            .collect::<Vec<_>>()
            .join("\n");
        out.push_str(&render_segment(EXECUTION_PATH, &body));
    }
    if !older.is_empty() || !trail.is_empty() {
        out.push_str(COMPRESSED_MARKER);
        out.push('\n');
    }
    for segment in recent {
        out.push_str(&segment.render());
    }

    hard_truncate(&out, budget)
}

/// Keep only head and tail of `text` so the result fits `max_chars`.
pub fn hard_truncate(text: &str, budget: &CompressionBudget) -> String {
    let len = char_len(text);
    if len <= budget.max_chars {
        return text.to_string();
    }
    let marker_len = char_len(TRIM_MARKER);
    if budget.max_chars <= marker_len {
        return take_last_chars(text, budget.max_chars);
    }
    let available = budget.max_chars - marker_len;
    let (mut head, mut tail) = (budget.head_chars, budget.tail_chars);
    if head + tail > available {
        let total = (head + tail).max(1);
        head = available * head / total;
        tail = available - head;
    }
    let head_text: String = text.chars().take(head).collect();
    let tail_text = take_last_chars(text, tail);
    format!("{head_text}{TRIM_MARKER}{tail_text}")
}

/// Bound text to its last `max_chars` characters.
pub fn take_last_chars(text: &str, max_chars: usize) -> String {
    let len = char_len(text);
    if len <= max_chars {
        return text.to_string();
    }
    text.chars().skip(len - max_chars).collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn path_entries(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("- "))
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn segment_commands(segment: &Segment) -> Vec<String> {
    let mut commands: Vec<String> = segment
        .body
        .lines()
        .filter_map(|line| line.strip_prefix(transcript::COMMAND_PREFIX))
        .map(|cmd| single_line(cmd.trim()))
        .filter(|cmd| !cmd.is_empty())
        .collect();
    if commands.is_empty() && segment.label == PLANNER {
        let decision = single_line(segment.body.trim());
        if !decision.is_empty() {
            commands.push(decision);
        }
    }
    commands
}

fn single_line(text: &str) -> String {
    let first = text.lines().next().unwrap_or_default().trim();
    if first.chars().count() > 160 {
        let mut cut: String = first.chars().take(157).collect();
        cut.push_str("...");
        cut
    } else {
        first.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transcript::{EXECUTOR, Transcript};

    fn long_transcript(turns: usize) -> String {
        let mut transcript = Transcript::new("MAIN TASK: build the parser");
        for i in 0..turns {
            transcript.push(PLANNER, &format!("step {i}"));
            transcript.push_command(EXECUTOR, &format!("step {i}"), &"x".repeat(300));
        }
        transcript.text().to_string()
    }

    fn budget() -> CompressionBudget {
        CompressionBudget {
            max_chars: 2000,
            head_chars: 400,
            tail_chars: 1000,
            recent_segments: 3,
            max_path_entries: 5,
        }
    }

    #[test]
    fn short_history_is_unchanged() {
        let text = long_transcript(1);
        assert_eq!(compress_history(&text, &CompressionBudget::default()), text);
    }

    /// Verifies the task header survives and older turns become a bounded trail.
    #[test]
    fn keeps_task_and_recent_segments() {
        let text = long_transcript(20);
        let out = compress_history(&text, &budget());

        assert!(out.len() <= 2000);
        assert!(out.starts_with("--- TASK ---\nMAIN TASK: build the parser\n"));
        assert!(out.contains("--- EXECUTION PATH ---"));
        assert!(out.contains(COMPRESSED_MARKER));
        assert!(out.contains("$ step 19"));
        let (_, segments) = parse_segments(&out);
        let path = segments
            .iter()
            .find(|s| s.label == EXECUTION_PATH)
            .expect("path segment");
        assert_eq!(path.body.lines().count(), 5);
    }

    #[test]
    fn compression_is_idempotent() {
        let text = long_transcript(30);
        let once = compress_history(&text, &budget());
        let twice = compress_history(&once, &budget());
        assert_eq!(once, twice);
    }

    /// Verifies compressing again after new turns merges into the existing trail.
    #[test]
    fn recompression_merges_existing_trail() {
        let once = compress_history(&long_transcript(20), &budget());
        let mut grown = once.clone();
        for i in 20..26 {
            grown.push_str(&render_segment(PLANNER, &format!("step {i}")));
            grown.push_str(&render_segment(
                EXECUTOR,
                &format!("$ step {i}\n{}", "y".repeat(300)),
            ));
        }
        let out = compress_history(&grown, &budget());
        assert_eq!(out.matches("--- EXECUTION PATH ---").count(), 1);
        assert_eq!(out.matches("--- TASK ---").count(), 1);
        assert!(out.len() <= 2000);
    }

    #[test]
    fn hard_truncate_respects_budget_with_multibyte_text() {
        let text = "é".repeat(5000);
        let out = hard_truncate(&text, &budget());
        assert!(out.chars().count() <= 2000);
        assert!(out.contains("[context trimmed]"));
    }
}
