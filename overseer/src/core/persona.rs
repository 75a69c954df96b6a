//! Persona selection for tasks.

use anyhow::{Result, anyhow};
use regex::{Regex, RegexBuilder};

/// One `pattern -> persona` rule.
#[derive(Debug, Clone)]
pub struct PersonaRule {
    pattern: Regex,
    pub persona: String,
}

impl PersonaRule {
    /// `flags` containing `i` makes the match case-insensitive.
    pub fn new(pattern: &str, persona: &str, flags: &str) -> Result<Self> {
        if pattern.trim().is_empty() || persona.trim().is_empty() {
            return Err(anyhow!("persona rule needs a non-empty pattern and persona"));
        }
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(flags.contains('i'))
            .build()
            .map_err(|err| anyhow!("invalid persona rule pattern '{pattern}': {err}"))?;
        Ok(Self {
            pattern,
            persona: persona.trim().to_string(),
        })
    }

    /// Parse a CLI `PATTERN=PERSONA` mapping (always case-insensitive).
    pub fn from_cli(spec: &str) -> Result<Self> {
        let (pattern, persona) = spec
            .rsplit_once('=')
            .ok_or_else(|| anyhow!("persona map '{spec}' must be PATTERN=PERSONA"))?;
        Self::new(pattern, persona, "i")
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// Pick a persona: explicit task persona, first matching rule, then mission default.
pub fn select_persona(
    task_persona: Option<&str>,
    task_text: &str,
    rules: &[PersonaRule],
    default: Option<&str>,
) -> Option<String> {
    if let Some(persona) = task_persona.map(str::trim).filter(|p| !p.is_empty()) {
        return Some(persona.to_string());
    }
    if let Some(rule) = rules.iter().find(|rule| rule.matches(task_text)) {
        return Some(rule.persona.clone());
    }
    default
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}
