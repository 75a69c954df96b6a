//! Cleanup of agent CLI output and redaction of logged command lines.

use std::sync::LazyLock;

use regex::Regex;

pub const DIFF_TRIMMED_NOTICE: &str = "[... file diff content trimmed for brevity ...]";

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ansi regex")
});
static CODEX_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^codex\s*$").expect("codex marker regex"));
static TOKENS_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^tokens used\s*$").expect("tokens marker regex"));
static COUNT_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(?:,\d{3})*$").expect("count regex"));
static NOISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    let patterns = [
        r"^tokens used\s*$",
        r"^\d{1,3}(?:,\d{3})*$",
        r"^thinking\s*$",
        r"^\*\*Preparing.*$",
        r"^codex\s*$",
        r"^mcp startup.*$",
        r"^--------\s*$",
        r"^workdir:.*$",
        r"^model:.*$",
        r"^provider:.*$",
        r"^approval:.*$",
        r"^sandbox:.*$",
        r"^reasoning.*$",
        r"^session id:.*$",
        r"^OpenAI Codex.*$",
        r".*succeeded in \d+ms:$",
        r"^success\s*$",
        r"^loading model.*$",
        r"^.*\[\d+%\].*$",
        r"^.*[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏].*$",
    ];
    Regex::new(&format!("(?i)(?:{})", patterns.join("|"))).expect("noise regex")
});
static SECRET_ASSIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([^=\s]*(?:api_key|apikey|token|password|secret)[^=\s]*)=.+$")
        .expect("secret assignment regex")
});

const SECRET_FLAGS: [&str; 4] = ["--api-key", "--token", "--password", "--key"];
const REDACTED: &str = "<redacted>";

/// Strip ANSI escapes only.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Reduce agent CLI output to the part worth showing a planner.
///
/// Strips ANSI escapes, keeps only the tail after the last `codex` or
/// `tokens used` marker, drops known status noise, and replaces any git diff
/// with a short notice.
pub fn clean_output(text: &str) -> String {
    let stripped = strip_ansi(text);
    let lines: Vec<&str> = stripped.lines().collect();

    // Markers that would leave nothing after them are skipped.
    let mut start = 0;
    for idx in (0..lines.len()).rev() {
        let line = lines[idx].trim();
        let candidate = if CODEX_MARKER_RE.is_match(line) {
            idx + 1
        } else if TOKENS_MARKER_RE.is_match(line) {
            match lines.get(idx + 1) {
                Some(next) if COUNT_LINE_RE.is_match(next.trim()) => idx + 2,
                _ => idx + 1,
            }
        } else {
            continue;
        };
        if candidate < lines.len() {
            start = candidate;
            break;
        }
    }

    let mut kept = Vec::new();
    for line in &lines[start..] {
        let trimmed = line.trim();
        if trimmed.starts_with("diff --git") {
            kept.push(String::new());
            kept.push(DIFF_TRIMMED_NOTICE.to_string());
            break;
        }
        if NOISE_RE.is_match(trimmed) {
            continue;
        }
        kept.push(line.trim_end().to_string());
    }
    kept.join("\n").trim().to_string()
}

/// Redact secrets from an argument vector before it is logged.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            out.push(REDACTED.to_string());
            redact_next = false;
            continue;
        }
        if SECRET_FLAGS.contains(&arg.as_str()) {
            redact_next = true;
            out.push(arg.clone());
            continue;
        }
        if let Some((flag, _)) = arg.split_once('=')
            && SECRET_FLAGS.contains(&flag)
        {
            out.push(format!("{flag}={REDACTED}"));
            continue;
        }
        if let Some(caps) = SECRET_ASSIGN_RE.captures(arg) {
            out.push(format!("{}={REDACTED}", &caps[1]));
            continue;
        }
        out.push(arg.clone());
    }
    out
}
