//! Orchestrator settings (`settings.yaml` or `settings.toml`).
//!
//! Settings are loaded into a generic YAML value first so mission-level role
//! overrides can be deep-merged before the typed parse. Missing keys fall back
//! to defaults; a missing file yields `Settings::default()`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::core::compression::CompressionBudget;
use crate::core::confidence::ConfidenceThresholds;
use crate::core::persona::PersonaRule;
use crate::error::OverseerError;
use crate::io::lock::LockOptions;

/// One external agent CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub command: String,
    /// Template tokens; `{prompt}`, `{query}` and `{system_prompt_file}` are substituted.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    pub retry_backoff: Option<f64>,
}

impl DriverConfig {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voting {
    #[default]
    All,
    Majority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    #[default]
    Project,
    Global,
    Both,
}

/// Keys of a role block that are options rather than driver names.
const RESERVED_ROLE_KEYS: [&str; 14] = [
    "active_driver",
    "active_drivers",
    "drivers",
    "voting",
    "timeout",
    "retries",
    "retry_backoff",
    "output_format",
    "home_dir",
    "use_real_home",
    "link_auth",
    "strictness",
    "enabled",
    "max_rejections",
];

/// Driver block for one role (`brain`, `critic`, `body`).
///
/// Drivers may be nested under `drivers:` or listed flat next to the options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Mapping")]
pub struct RoleSettings {
    pub active_driver: Option<String>,
    pub drivers: BTreeMap<String, DriverConfig>,
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    pub retry_backoff: Option<f64>,
    pub output_format: OutputFormat,
    pub home_dir: Option<String>,
    pub use_real_home: bool,
    pub link_auth: bool,
    pub enabled: Option<bool>,
    /// Critic only: several voting drivers.
    pub active_drivers: Vec<String>,
    pub voting: Voting,
    pub max_rejections: Option<u32>,
}

impl Default for RoleSettings {
    fn default() -> Self {
        Self {
            active_driver: None,
            drivers: BTreeMap::new(),
            timeout: None,
            retries: None,
            retry_backoff: None,
            output_format: OutputFormat::Text,
            home_dir: None,
            use_real_home: false,
            link_auth: true,
            enabled: None,
            active_drivers: Vec::new(),
            voting: Voting::All,
            max_rejections: None,
        }
    }
}

impl TryFrom<Mapping> for RoleSettings {
    type Error = String;

    fn try_from(map: Mapping) -> std::result::Result<Self, Self::Error> {
        let mut role = RoleSettings {
            active_driver: field(&map, "active_driver")?,
            timeout: field(&map, "timeout")?,
            retries: field(&map, "retries")?,
            retry_backoff: field(&map, "retry_backoff")?,
            output_format: field(&map, "output_format")?.unwrap_or_default(),
            home_dir: field(&map, "home_dir")?,
            use_real_home: field(&map, "use_real_home")?.unwrap_or(false),
            link_auth: field(&map, "link_auth")?.unwrap_or(true),
            enabled: field(&map, "enabled")?,
            active_drivers: field(&map, "active_drivers")?.unwrap_or_default(),
            voting: field(&map, "voting")?.unwrap_or_default(),
            max_rejections: field(&map, "max_rejections")?,
            ..RoleSettings::default()
        };
        if let Some(nested) = field::<BTreeMap<String, DriverConfig>>(&map, "drivers")? {
            role.drivers = nested;
            return Ok(role);
        }
        for (key, value) in &map {
            let Some(name) = key.as_str() else {
                return Err(format!("driver name must be a string, got {key:?}"));
            };
            if RESERVED_ROLE_KEYS.contains(&name) {
                continue;
            }
            let driver: DriverConfig = serde_yaml::from_value(value.clone())
                .map_err(|err| format!("driver '{name}': {err}"))?;
            role.drivers.insert(name.to_string(), driver);
        }
        Ok(role)
    }
}

fn field<T: DeserializeOwned>(map: &Mapping, key: &str) -> std::result::Result<Option<T>, String> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_yaml::from_value(value.clone())
            .map(Some)
            .map_err(|err| format!("{key}: {err}")),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    pub auto_rollback_on_failure: bool,
    pub create_backup_branch: bool,
    pub auto_commit_and_push: bool,
    pub require_approval_for_destructive: bool,
    pub use_worktrees: bool,
    pub preview_changes: bool,
    /// Extra case-insensitive regexes treated as destructive.
    pub destructive_patterns: Vec<String>,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            auto_rollback_on_failure: false,
            create_backup_branch: false,
            auto_commit_and_push: false,
            require_approval_for_destructive: true,
            use_worktrees: false,
            preview_changes: false,
            destructive_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersonaRuleSettings {
    pub pattern: String,
    pub persona: String,
    pub flags: String,
}

impl Default for PersonaRuleSettings {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            persona: String::new(),
            flags: "i".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QaSettings {
    pub run_tests: bool,
    pub test_on_each_task: bool,
    pub test_command: String,
    pub timeout_secs: u64,
}

impl Default for QaSettings {
    fn default() -> Self {
        Self {
            run_tests: false,
            test_on_each_task: true,
            test_command: String::new(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub scope: MemoryScope,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParallelSettings {
    pub max_workers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContextReductionSettings {
    pub enabled: bool,
    pub max_chars: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
    pub recent_segments: usize,
    pub max_path_entries: usize,
    /// Tail of the last executor output shown to the planner.
    pub last_output_chars: usize,
}

impl Default for ContextReductionSettings {
    fn default() -> Self {
        let budget = CompressionBudget::default();
        Self {
            enabled: true,
            max_chars: budget.max_chars,
            head_chars: budget.head_chars,
            tail_chars: budget.tail_chars,
            recent_segments: budget.recent_segments,
            max_path_entries: budget.max_path_entries,
            last_output_chars: 3000,
        }
    }
}

impl ContextReductionSettings {
    pub fn budget(&self) -> CompressionBudget {
        CompressionBudget {
            max_chars: self.max_chars,
            head_chars: self.head_chars,
            tail_chars: self.tail_chars,
            recent_segments: self.recent_segments,
            max_path_entries: self.max_path_entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SelfCheckSettings {
    pub enabled: bool,
    /// Consecutive failures after which the next failing claim is force-passed.
    pub max_failures: u32,
}

impl Default for SelfCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfidenceSettings {
    pub enabled: bool,
    pub high_threshold: f64,
    pub low_threshold: f64,
}

impl Default for ConfidenceSettings {
    fn default() -> Self {
        let thresholds = ConfidenceThresholds::default();
        Self {
            enabled: true,
            high_threshold: thresholds.high,
            low_threshold: thresholds.low,
        }
    }
}

impl ConfidenceSettings {
    pub fn thresholds(&self) -> ConfidenceThresholds {
        ConfidenceThresholds {
            high: self.high_threshold,
            low: self.low_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReflexionSettings {
    pub enabled: bool,
    pub threshold: f64,
    pub max_fixes: usize,
}

impl Default for ReflexionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.7,
            max_fixes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub max_sleep_chunk_secs: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            max_sleep_chunk_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub max_turns: u32,
    pub turn_pause_ms: u64,
    pub local_check_timeout_secs: u64,
    /// Consecutive failed planner turns before a task is blocked.
    pub max_planner_failures: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_turns: 60,
            turn_pause_ms: 2000,
            local_check_timeout_secs: 30,
            max_planner_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    pub enabled: bool,
    pub require_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub lock_timeout_secs: u64,
    pub lock_poll_ms: u64,
    pub stale_lock_secs: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 30,
            lock_poll_ms: 50,
            stale_lock_secs: 600,
        }
    }
}

impl PersistenceSettings {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_secs(self.lock_timeout_secs),
            poll: Duration::from_millis(self.lock_poll_ms.max(1)),
            stale_after: Duration::from_secs(self.stale_lock_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Full settings document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub brain: RoleSettings,
    pub critic: RoleSettings,
    pub body: RoleSettings,
    pub safety: SafetySettings,
    pub personas: BTreeMap<String, String>,
    pub persona_rules: Vec<PersonaRuleSettings>,
    pub qa: QaSettings,
    pub memory: MemorySettings,
    pub parallel: ParallelSettings,
    pub context_reduction: ContextReductionSettings,
    pub self_check: SelfCheckSettings,
    pub confidence: ConfidenceSettings,
    pub reflexion: ReflexionSettings,
    pub quota: QuotaSettings,
    pub orchestrator: OrchestratorSettings,
    pub planner: PlannerSettings,
    /// Free-text tool registry forwarded into prompts.
    pub tools: Vec<String>,
    pub persistence: PersistenceSettings,
    pub metrics: MetricsSettings,
    pub resume: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            brain: RoleSettings::default(),
            critic: RoleSettings::default(),
            body: RoleSettings::default(),
            safety: SafetySettings::default(),
            personas: BTreeMap::new(),
            persona_rules: Vec::new(),
            qa: QaSettings::default(),
            memory: MemorySettings::default(),
            parallel: ParallelSettings::default(),
            context_reduction: ContextReductionSettings::default(),
            self_check: SelfCheckSettings::default(),
            confidence: ConfidenceSettings::default(),
            reflexion: ReflexionSettings::default(),
            quota: QuotaSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            planner: PlannerSettings::default(),
            tools: Vec::new(),
            persistence: PersistenceSettings::default(),
            metrics: MetricsSettings::default(),
            resume: true,
        }
    }
}

impl Settings {
    /// Parse settings from a merged YAML value and validate them.
    pub fn from_value(value: Value) -> Result<Self> {
        let value = match value {
            Value::Null => Value::Mapping(Mapping::new()),
            other => other,
        };
        let settings: Settings = serde_yaml::from_value(value)
            .map_err(|err| OverseerError::Configuration(format!("settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        for (role, block) in [
            ("brain", &self.brain),
            ("critic", &self.critic),
            ("body", &self.body),
        ] {
            validate_role(role, block)?;
        }
        self.compiled_persona_rules()?;
        if self.parallel.max_workers == Some(0) {
            return Err(config_error("parallel.max_workers must be > 0"));
        }
        let cr = &self.context_reduction;
        if cr.max_chars == 0 || cr.last_output_chars == 0 {
            return Err(config_error(
                "context_reduction.max_chars and last_output_chars must be > 0",
            ));
        }
        let conf = &self.confidence;
        if !(0.0..=1.0).contains(&conf.low_threshold)
            || !(0.0..=1.0).contains(&conf.high_threshold)
            || conf.low_threshold > conf.high_threshold
        {
            return Err(config_error(
                "confidence thresholds must satisfy 0 <= low_threshold <= high_threshold <= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.reflexion.threshold) {
            return Err(config_error("reflexion.threshold must be within [0, 1]"));
        }
        if self.orchestrator.max_turns == 0 {
            return Err(config_error("orchestrator.max_turns must be > 0"));
        }
        if self.orchestrator.max_planner_failures == 0 {
            return Err(config_error("orchestrator.max_planner_failures must be > 0"));
        }
        if self.persistence.lock_timeout_secs == 0 || self.persistence.lock_poll_ms == 0 {
            return Err(config_error(
                "persistence.lock_timeout_secs and lock_poll_ms must be > 0",
            ));
        }
        if self.quota.max_sleep_chunk_secs == 0 {
            return Err(config_error("quota.max_sleep_chunk_secs must be > 0"));
        }
        Ok(())
    }

    /// Settings rules compiled, in order.
    pub fn compiled_persona_rules(&self) -> Result<Vec<PersonaRule>> {
        self.persona_rules
            .iter()
            .enumerate()
            .map(|(idx, rule)| {
                PersonaRule::new(&rule.pattern, &rule.persona, &rule.flags)
                    .map_err(|err| config_error(&format!("persona_rules[{idx}]: {err}")))
            })
            .collect()
    }

    /// Guidelines text for a persona, empty when unknown.
    pub fn persona_guidelines(&self, persona: Option<&str>) -> String {
        persona
            .and_then(|name| self.personas.get(name))
            .cloned()
            .unwrap_or_default()
    }
}

fn validate_role(role: &str, block: &RoleSettings) -> Result<()> {
    for (name, driver) in &block.drivers {
        if driver.command.trim().is_empty() {
            return Err(config_error(&format!(
                "{role}.{name}.command must be a non-empty string"
            )));
        }
        if let Some(backoff) = driver.retry_backoff
            && backoff <= 0.0
        {
            return Err(config_error(&format!(
                "{role}.{name}.retry_backoff must be > 0"
            )));
        }
    }
    if let Some(backoff) = block.retry_backoff
        && backoff <= 0.0
    {
        return Err(config_error(&format!("{role}.retry_backoff must be > 0")));
    }
    if block.drivers.is_empty() {
        return Ok(());
    }
    if let Some(active) = &block.active_driver
        && !block.drivers.contains_key(active)
    {
        return Err(config_error(&format!(
            "{role}.active_driver '{active}' is not defined in drivers"
        )));
    }
    for name in &block.active_drivers {
        if !block.drivers.contains_key(name) {
            return Err(config_error(&format!(
                "{role}.active_drivers entry '{name}' is not defined in drivers"
            )));
        }
    }
    Ok(())
}

fn config_error(message: &str) -> anyhow::Error {
    OverseerError::Configuration(message.to_string()).into()
}

/// Read a YAML or TOML document (by extension) into a generic value.
///
/// A missing file yields an empty mapping.
pub fn load_document(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_document(path, &contents)
}

pub fn parse_document(path: &Path, contents: &str) -> Result<Value> {
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let value = if is_toml {
        toml::from_str::<Value>(contents)
            .map_err(|err| OverseerError::Configuration(format!("parse {}: {err}", path.display())))?
    } else {
        serde_yaml::from_str::<Value>(contents)
            .map_err(|err| OverseerError::Configuration(format!("parse {}: {err}", path.display())))?
    };
    Ok(value)
}

/// Deep-merge `overlay` into `base`. Mappings merge key by key; anything else replaces.
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Load settings from `path`, applying mission-level overrides first.
pub fn load_settings(path: &Path, overrides: Option<&Value>) -> Result<Settings> {
    let mut value = load_document(path)?;
    if value.is_null() {
        value = Value::Mapping(Mapping::new());
    }
    if let Some(overrides) = overrides {
        merge_values(&mut value, overrides);
    }
    Settings::from_value(value).with_context(|| format!("load settings {}", path.display()))
}
