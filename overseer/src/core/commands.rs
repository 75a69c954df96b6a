//! Classification of planner commands.
//!
//! Observational commands are read-only and run locally without an agent turn.
//! Destructive commands need explicit approval before the executor sees them.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::{Regex, RegexBuilder};

pub const OBSERVATIONAL_PROGRAMS: [&str; 11] = [
    "ls", "cat", "rg", "grep", "sed", "head", "tail", "stat", "wc", "find", "pwd",
];

const SHELL_META: [&str; 7] = ["|", "&", ";", ">", "<", "`", "$("];

pub const DEFAULT_DESTRUCTIVE_PATTERNS: [&str; 7] = [
    r"\brm\s+-rf\b",
    r"\bgit\s+reset\b",
    r"\bgit\s+clean\b",
    r"\bdel\s+/f\b",
    r"\brmdir\b",
    r"\bshutdown\b",
    r"\breboot\b",
];

static VERIFICATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(cat|ls|grep|rg|find|head|tail|wc|stat|git\s+(status|diff|log|show)|read|view|list|show|check|verify|test|run\s+(the\s+)?tests|cargo\s+test|pytest|npm\s+test|go\s+test|make\s+test)\b",
    )
    .expect("verification regex")
});

/// Split an observational command into argv, or `None` when it is not one.
///
/// Accepts only whitelisted read-only programs with no shell metacharacters.
/// Flags that write files or run other programs disqualify the command, and
/// `sed` scripts are limited to addresses plus `p`, `n`, `=`, `l`, `q`.
pub fn observational_argv(command: &str) -> Option<Vec<String>> {
    let trimmed = command.trim();
    if trimmed.is_empty() || trimmed.contains('\n') {
        return None;
    }
    if SHELL_META.iter().any(|meta| trimmed.contains(meta)) {
        return None;
    }
    let argv = shell_words::split(trimmed).ok()?;
    let (program, args) = argv.split_first()?;
    let read_only = match program.as_str() {
        "sed" => sed_is_read_only(args),
        "rg" => !args.iter().any(|arg| {
            ["--pre", "--pre-glob"]
                .iter()
                .any(|flag| arg.as_str() == *flag || arg.starts_with(&format!("{flag}=")))
        }),
        "find" => !args.iter().any(|arg| FIND_ACTIONS.contains(&arg.as_str())),
        other => OBSERVATIONAL_PROGRAMS.contains(&other),
    };
    read_only.then_some(argv)
}

/// `find` primaries that write files or spawn programs.
const FIND_ACTIONS: [&str; 9] = [
    "-delete", "-exec", "-execdir", "-ok", "-okdir", "-fprint", "-fprint0", "-fprintf", "-fls",
];

const SED_LONG_FLAGS: [&str; 7] = [
    "--quiet",
    "--silent",
    "--regexp-extended",
    "--separate",
    "--unbuffered",
    "--null-data",
    "--posix",
];

/// Print-only sed program: optional address range, optional `!`, then one of `p n = l q`.
static SED_SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    let addr = r"(?:\d+|\$|/(?:[^/\\]|\\.)*/)";
    Regex::new(&format!(
        r"^\s*(?:{addr}(?:\s*,\s*(?:{addr}|[+~]\d+))?)?\s*!?\s*[pn=lq]?\s*$"
    ))
    .expect("sed script regex")
});

/// Options may only be `-n`, `-E`, `-r`, `-s`, `-u`, `-z` and `-e SCRIPT`;
/// the first operand is the script when no `-e` was given.
fn sed_is_read_only(args: &[String]) -> bool {
    let mut scripts: Vec<&str> = Vec::new();
    let mut operands: Vec<&str> = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if SED_LONG_FLAGS.contains(&arg.as_str()) {
            continue;
        }
        if let Some(script) = arg.strip_prefix("--expression=") {
            scripts.push(script);
        } else if arg == "--expression" {
            let Some(script) = iter.next() else {
                return false;
            };
            scripts.push(script);
        } else if arg.starts_with("--") {
            return false;
        } else if let Some(cluster) = arg.strip_prefix('-').filter(|c| !c.is_empty()) {
            for (idx, flag) in cluster.char_indices() {
                match flag {
                    'n' | 'E' | 'r' | 's' | 'u' | 'z' => {}
                    'e' => {
                        let rest = &cluster[idx + 1..];
                        if rest.is_empty() {
                            let Some(script) = iter.next() else {
                                return false;
                            };
                            scripts.push(script);
                        } else {
                            scripts.push(rest);
                        }
                        break;
                    }
                    _ => return false,
                }
            }
        } else {
            operands.push(arg);
        }
    }
    if scripts.is_empty() {
        let Some(&script) = operands.first() else {
            return false;
        };
        scripts.push(script);
    }
    scripts.iter().all(|script| SED_SCRIPT_RE.is_match(script))
}

pub fn is_observational(command: &str) -> bool {
    observational_argv(command).is_some()
}

/// True when the command reads, lists, searches, or tests.
pub fn is_verification(command: &str) -> bool {
    is_observational(command) || VERIFICATION_RE.is_match(command)
}

/// Compiled destructive-command patterns (case-insensitive).
#[derive(Debug, Clone)]
pub struct DestructiveMatcher {
    patterns: Vec<Regex>,
}

impl DestructiveMatcher {
    /// Built-in patterns plus any extra ones from settings.
    pub fn new(extra: &[String]) -> Result<Self> {
        let mut patterns = Vec::new();
        let all = DEFAULT_DESTRUCTIVE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().cloned());
        for pattern in all {
            let regex = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map_err(|err| anyhow!("invalid destructive pattern '{pattern}': {err}"))?;
            patterns.push(regex);
        }
        Ok(Self { patterns })
    }

    /// The first pattern the command matches.
    pub fn matched(&self, command: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|re| re.is_match(command))
            .map(Regex::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_read_commands() {
        assert_eq!(
            observational_argv("rg -n 'fn main' src"),
            Some(vec![
                "rg".to_string(),
                "-n".to_string(),
                "fn main".to_string(),
                "src".to_string(),
            ])
        );
        assert!(is_observational("ls -la"));
        assert!(is_observational("sed -n 1,20p src/lib.rs"));
        assert!(is_observational("sed -n '/fn main/,/^}/p' src/main.rs"));
        assert!(is_observational("sed -ne 5p -e '$p' notes.md"));
        assert!(is_observational("sed 10q README.md"));
        assert!(is_observational("find . -name '*.rs' -type f"));
    }

    /// Verifies sed scripts that run commands or touch files are refused.
    #[test]
    fn rejects_sed_scripts_that_execute_or_write() {
        assert!(!is_observational("sed -n '1e touch PWNED' f.txt"));
        assert!(!is_observational("sed -n '1e rm -rf build' x"));
        assert!(!is_observational("sed -n '1w copy.txt' f.txt"));
        assert!(!is_observational("sed -n '1W copy.txt' f.txt"));
        assert!(!is_observational("sed '1r other.txt' f.txt"));
        assert!(!is_observational("sed -e p -e 'w out' f.txt"));
        assert!(!is_observational("sed --expression='s/a/b/w out' f.txt"));
        assert!(!is_observational("sed -f script.sed f.txt"));
        assert!(!is_observational("sed -ni p f.txt"));
        assert!(!is_observational("sed -n"));
    }

    #[test]
    fn rejects_rg_preprocessors_and_find_file_actions() {
        assert!(!is_observational("rg --pre=./evil.sh x"));
        assert!(!is_observational("rg --pre ./evil.sh x"));
        assert!(!is_observational("rg --pre-glob '*.pdf' --pre pdftotext x"));
        assert!(!is_observational("find . -fprint0 out.bin"));
        assert!(!is_observational("find . -fprintf out.txt %p"));
        assert!(!is_observational("find . -fls listing.txt"));
        assert!(is_observational("rg --pretty fn src"));
    }

    /// Verifies pipes, redirects, and mutating flags disqualify a command.
    #[test]
    fn rejects_shell_meta_and_mutation() {
        assert!(!is_observational("cat a.txt | grep x"));
        assert!(!is_observational("ls > out.txt"));
        assert!(!is_observational("ls; rm -rf /"));
        assert!(!is_observational("cat $(echo a)"));
        assert!(!is_observational("sed -i s/a/b/ file"));
        assert!(!is_observational("find . -delete"));
        assert!(!is_observational("python script.py"));
        assert!(!is_observational("Write a README"));
    }

    #[test]
    fn verification_includes_tests_and_git_reads() {
        assert!(is_verification("cargo test --all"));
        assert!(is_verification("git diff HEAD~1"));
        assert!(is_verification("Verify the output file exists"));
        assert!(!is_verification("Create hello.py"));
    }

    #[test]
    fn destructive_patterns_match_case_insensitively() {
        let matcher = DestructiveMatcher::new(&["drop\\s+table".to_string()]).expect("matcher");
        assert!(matcher.matched("RM -RF build").is_some());
        assert!(matcher.matched("please git reset --hard").is_some());
        assert!(matcher.matched("DROP TABLE users").is_some());
        assert!(matcher.matched("cargo build").is_none());
    }

    #[test]
    fn invalid_extra_pattern_is_an_error() {
        assert!(DestructiveMatcher::new(&["(".to_string()]).is_err());
    }
}
