//! Argument template rendering.

use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

pub const PROMPT: &str = "{prompt}";
pub const QUERY: &str = "{query}";

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(prompt|query|system_prompt_file)\}").expect("placeholder regex")
});

/// Values substituted into driver argument templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub prompt: &'a str,
    pub system_prompt_file: Option<&'a Path>,
}

pub fn has_prompt_placeholder(args: &[String]) -> bool {
    args.iter()
        .any(|arg| arg.contains(PROMPT) || arg.contains(QUERY))
}

/// Substitute placeholders into each token.
///
/// Tokens that render empty are dropped. A bare `--flag` directly before a
/// dropped placeholder token is dropped with it, so no flag is left without
/// its value.
pub fn render_args(args: &[String], vars: TemplateVars<'_>) -> Vec<String> {
    let system_prompt_file = vars
        .system_prompt_file
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let mut out: Vec<String> = Vec::with_capacity(args.len());
    let mut prev_was_bare_flag = false;
    for arg in args {
        let had_placeholder = PLACEHOLDER_RE.is_match(arg);
        // One pass, so placeholder text inside substituted values stays literal.
        let rendered = PLACEHOLDER_RE
            .replace_all(arg, |caps: &Captures<'_>| match &caps[1] {
                "system_prompt_file" => system_prompt_file.as_str(),
                _ => vars.prompt,
            })
            .into_owned();
        if rendered.is_empty() {
            if had_placeholder && prev_was_bare_flag {
                out.pop();
            }
            prev_was_bare_flag = false;
            continue;
        }
        prev_was_bare_flag = !had_placeholder && rendered.starts_with('-') && !rendered.contains('=');
        out.push(rendered);
    }
    out
}
