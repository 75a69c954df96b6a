//! Long-term "lessons learned" notes kept across missions.
//!
//! Notes live in `memories.md` under the project `.overseer/` directory and/or
//! `~/.overseer/`, one `### <timestamp>` section per lesson.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use tracing::warn;

use crate::io::config::MemoryScope;
use crate::io::fs_util::append_line;

static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^### \d{4}-\d{2}-\d{2}").expect("section regex"));
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("word regex"));

const MAX_RECALLED: usize = 3;

#[derive(Debug, Clone)]
pub struct MemoryStore {
    files: Vec<PathBuf>,
}

impl MemoryStore {
    /// `global_dir` is usually `~/.overseer`; `None` disables the global file.
    pub fn new(scope: MemoryScope, overseer_dir: &Path, global_dir: Option<&Path>) -> Self {
        let mut files = Vec::new();
        if matches!(scope, MemoryScope::Project | MemoryScope::Both) {
            files.push(overseer_dir.join("memories.md"));
        }
        if matches!(scope, MemoryScope::Global | MemoryScope::Both)
            && let Some(dir) = global_dir
        {
            files.push(dir.join("memories.md"));
        }
        Self { files }
    }

    /// Default global memory directory (`~/.overseer`).
    pub fn default_global_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".overseer"))
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// All memories, or the sections most relevant to `query`.
    ///
    /// With three sections or fewer everything is returned. Otherwise the top
    /// three sections by word overlap are returned, or nothing if none overlap.
    pub fn recall(&self, query: Option<&str>) -> Result<String> {
        let mut all = String::new();
        for path in &self.files {
            let contents = match fs::read_to_string(path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
            };
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                if !all.is_empty() {
                    all.push_str("\n\n");
                }
                all.push_str(trimmed);
            }
        }
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            return Ok(all);
        };
        if all.is_empty() {
            return Ok(all);
        }

        let sections = split_sections(&all);
        if sections.len() <= MAX_RECALLED {
            return Ok(all);
        }
        let query_words = words(query);
        let mut scored: Vec<(usize, &str)> = sections
            .iter()
            .map(|section| (words(section).intersection(&query_words).count(), *section))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(MAX_RECALLED)
            .map(|(_, section)| section)
            .collect::<Vec<_>>()
            .join("\n\n---\n"))
    }

    /// Append one lesson to every configured file. Failures are logged per file.
    pub fn save(&self, insight: &str) {
        let insight = insight.trim();
        if insight.is_empty() {
            return;
        }
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let block = format!("\n### {stamp}\n{insight}");
        for path in &self.files {
            if let Err(err) = append_line(path, &block) {
                warn!(path = %path.display(), err = %format!("{err:#}"), "failed to save memory");
            }
        }
    }
}

fn split_sections(text: &str) -> Vec<&str> {
    let mut starts: Vec<usize> = SECTION_RE.find_iter(text).map(|m| m.start()).collect();
    if starts.first() != Some(&0) {
        starts.insert(0, 0);
    }
    let mut sections = Vec::new();
    for (idx, start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(text.len());
        let section = text[*start..end].trim();
        if !section.is_empty() {
            sections.push(section);
        }
    }
    sections
}

fn words(text: &str) -> HashSet<String> {
    WORD_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}
