//! Labeled task transcript.
//!
//! A transcript is plain text made of segments, each introduced by a marker
//! line `--- LABEL ---`. The same text is shown to agents, compressed for
//! prompts, written to disk, and inspected by the self-check gate.

use std::sync::LazyLock;

use regex::Regex;

pub const TASK: &str = "TASK";
pub const PLANNER: &str = "PLANNER";
pub const EXECUTOR: &str = "EXECUTOR";
pub const LOCAL_CHECK: &str = "LOCAL CHECK";
pub const TESTS: &str = "TESTS";
pub const CRITIC: &str = "CRITIC";
pub const SYSTEM: &str = "SYSTEM";
pub const EXECUTION_PATH: &str = "EXECUTION PATH";

/// Prefix of the line holding the command inside executor/local-check segments.
pub const COMMAND_PREFIX: &str = "$ ";

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^--- ([A-Z][A-Z0-9 _\-]*) ---$").expect("marker regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub label: String,
    pub body: String,
}

impl Segment {
    /// The `$ command` line of the segment, if any.
    pub fn command(&self) -> Option<&str> {
        self.body
            .lines()
            .find_map(|line| line.strip_prefix(COMMAND_PREFIX))
            .map(str::trim)
    }

    /// Body without the `$ command` line.
    pub fn output(&self) -> String {
        self.body
            .lines()
            .filter(|line| !line.starts_with(COMMAND_PREFIX))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn render(&self) -> String {
        render_segment(&self.label, &self.body)
    }
}

pub fn render_segment(label: &str, body: &str) -> String {
    format!("--- {label} ---\n{}\n", body.trim_end())
}

fn escape_markers(body: &str) -> String {
    body.lines()
        .map(|line| {
            if MARKER_RE.is_match(line.trim_end()) {
                format!(" {line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split text into the preamble before the first marker and its segments.
pub fn parse_segments(text: &str) -> (String, Vec<Segment>) {
    let mut preamble = Vec::new();
    let mut segments: Vec<Segment> = Vec::new();
    for line in text.lines() {
        if let Some(caps) = MARKER_RE.captures(line.trim_end()) {
            segments.push(Segment {
                label: caps[1].to_string(),
                body: String::new(),
            });
            continue;
        }
        match segments.last_mut() {
            Some(segment) => {
                if !segment.body.is_empty() {
                    segment.body.push('\n');
                }
                segment.body.push_str(line);
            }
            None => preamble.push(line),
        }
    }
    for segment in &mut segments {
        let trimmed = segment.body.trim_end().to_string();
        segment.body = trimmed;
    }
    (preamble.join("\n").trim().to_string(), segments)
}

/// Append-only transcript of one task.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    text: String,
}

impl Transcript {
    pub fn new(task_block: &str) -> Self {
        let mut transcript = Self::default();
        transcript.push(TASK, task_block);
        transcript
    }

    /// Body lines shaped like a marker are indented so they stay inside this segment.
    pub fn push(&mut self, label: &str, body: &str) {
        self.text.push_str(&render_segment(label, &escape_markers(body)));
    }

    /// Record an executed command with its observation.
    ///
    /// Observation lines starting with `$ ` are indented so only the first
    /// line reads as the command.
    pub fn push_command(&mut self, label: &str, command: &str, observation: &str) {
        let observation = observation
            .trim_end()
            .lines()
            .map(|line| {
                if line.starts_with(COMMAND_PREFIX) {
                    format!(" {line}")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        let body = format!("{COMMAND_PREFIX}{}\n{observation}", command.trim());
        self.push(label, &body);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> Vec<Segment> {
        parse_segments(&self.text).1
    }
}
