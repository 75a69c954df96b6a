//! Role → driver resolution with executable fallback.
//!
//! Order: the named active driver, the remaining configured drivers in
//! lexical order, then the built-in defaults. The first whose executable
//! resolves wins.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::driver::cli::{CliDriver, InvocationPolicy};
use crate::driver::home::prepare_home;
use crate::driver::{Driver, Role};
use crate::error::OverseerError;
use crate::io::clock::Clock;
use crate::io::config::{DriverConfig, RoleSettings};

pub trait ExecutableResolver: Send + Sync {
    fn resolve(&self, command: &str) -> Option<PathBuf>;
}

/// Looks commands up on `PATH`.
pub struct PathResolver;

impl ExecutableResolver for PathResolver {
    fn resolve(&self, command: &str) -> Option<PathBuf> {
        which::which(command).ok()
    }
}

/// Built-in drivers, in fallback order.
pub fn builtin_drivers(role: Role) -> Vec<(String, DriverConfig)> {
    let (claude, codex, gemini) = match role {
        Role::Planner | Role::Critic => (
            DriverConfig::new("claude", &["-p", "{prompt}"]),
            DriverConfig::new("codex", &["exec", "{prompt}"]),
            DriverConfig::new("gemini", &["-p", "{prompt}"]),
        ),
        Role::Executor => (
            DriverConfig::new(
                "claude",
                &[
                    "--system-prompt-file",
                    "{system_prompt_file}",
                    "-p",
                    "{query}",
                    "-c",
                    "--dangerously-skip-permissions",
                ],
            ),
            DriverConfig::new("codex", &["exec", "--full-auto", "{query}"]),
            DriverConfig::new("gemini", &["-p", "{query}", "--yolo"]),
        ),
    };
    vec![
        ("claude".to_string(), claude),
        ("codex".to_string(), codex),
        ("gemini".to_string(), gemini),
    ]
}

/// Candidate drivers for a role block, in resolution order.
pub fn candidates(role: Role, block: &RoleSettings) -> Vec<(String, DriverConfig)> {
    let mut out: Vec<(String, DriverConfig)> = Vec::new();
    if let Some(active) = &block.active_driver
        && let Some(config) = block.drivers.get(active)
    {
        out.push((active.clone(), config.clone()));
    }
    for (name, config) in &block.drivers {
        if block.active_driver.as_deref() != Some(name.as_str()) {
            out.push((name.clone(), config.clone()));
        }
    }
    for (name, config) in builtin_drivers(role) {
        if !out.iter().any(|(existing, _)| *existing == name) {
            out.push((name, config));
        }
    }
    out
}

/// Pick the first candidate whose executable resolves.
pub fn select(
    role: Role,
    block: &RoleSettings,
    resolver: &dyn ExecutableResolver,
) -> Result<(String, DriverConfig)> {
    let candidates = candidates(role, block);
    let preferred = candidates.first().map(|(name, _)| name.clone());
    for (name, config) in &candidates {
        if resolver.resolve(&config.command).is_some() {
            if preferred.as_deref() != Some(name.as_str()) {
                warn!(
                    role = %role,
                    preferred = ?preferred,
                    selected = %name,
                    "preferred driver unavailable, falling back"
                );
            }
            return Ok((name.clone(), config.clone()));
        }
    }
    Err(OverseerError::DriverUnavailable {
        role: role.to_string(),
        tried: candidates
            .iter()
            .map(|(name, config)| format!("{name} ({})", config.command))
            .collect::<Vec<_>>()
            .join(", "),
    }
    .into())
}

/// Builds drivers for roles from settings.
pub struct DriverRegistry {
    resolver: Box<dyn ExecutableResolver>,
    clock: Arc<dyn Clock>,
    /// Default planner HOME sandbox.
    brain_env_dir: PathBuf,
    real_home: Option<PathBuf>,
}

impl DriverRegistry {
    pub fn new(
        resolver: Box<dyn ExecutableResolver>,
        clock: Arc<dyn Clock>,
        brain_env_dir: PathBuf,
    ) -> Self {
        Self {
            resolver,
            clock,
            brain_env_dir,
            real_home: dirs::home_dir(),
        }
    }

    /// Resolve and construct the single driver for `role`.
    pub fn build(&self, role: Role, block: &RoleSettings) -> Result<Arc<dyn Driver>> {
        let (name, config) = select(role, block, self.resolver.as_ref())?;
        self.construct(role, block, name, config)
    }

    /// Critic voters: every resolvable `active_drivers` entry, or the single critic.
    pub fn build_voters(&self, block: &RoleSettings) -> Result<Vec<Arc<dyn Driver>>> {
        if block.active_drivers.is_empty() {
            return Ok(vec![self.build(Role::Critic, block)?]);
        }
        let mut voters = Vec::new();
        for name in &block.active_drivers {
            let Some(config) = block.drivers.get(name) else {
                continue;
            };
            if self.resolver.resolve(&config.command).is_none() {
                warn!(driver = %name, "critic voter unavailable, skipping");
                continue;
            }
            voters.push(self.construct(Role::Critic, block, name.clone(), config.clone())?);
        }
        if voters.is_empty() {
            return Err(OverseerError::DriverUnavailable {
                role: Role::Critic.to_string(),
                tried: block.active_drivers.join(", "),
            }
            .into());
        }
        Ok(voters)
    }

    fn construct(
        &self,
        role: Role,
        block: &RoleSettings,
        name: String,
        config: DriverConfig,
    ) -> Result<Arc<dyn Driver>> {
        let home = self.home_for(role, block)?;
        let policy = InvocationPolicy::resolve(role, block, &config);
        info!(
            role = %role,
            driver = %name,
            command = %config.command,
            timeout_secs = policy.timeout.as_secs(),
            retries = policy.retries,
            "driver selected"
        );
        Ok(Arc::new(CliDriver::new(
            name,
            config,
            policy,
            home,
            Arc::clone(&self.clock),
        )))
    }

    /// HOME override: explicit `home_dir`, or the planner sandbox, unless `use_real_home`.
    fn home_for(&self, role: Role, block: &RoleSettings) -> Result<Option<PathBuf>> {
        if block.use_real_home {
            return Ok(None);
        }
        let home = match (&block.home_dir, role) {
            (Some(dir), _) => PathBuf::from(dir),
            (None, Role::Planner) => self.brain_env_dir.clone(),
            (None, _) => return Ok(None),
        };
        prepare_home(&home, block.link_auth, self.real_home.as_deref())?;
        Ok(Some(home))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FixedResolver, ManualClock};

    fn block(yaml: &str) -> RoleSettings {
        serde_yaml::from_str(yaml).expect("role yaml")
    }

    #[test]
    fn candidates_order_active_then_lexical_then_builtin() {
        let block = block(
            "active_driver: zeta\nzeta: {command: z}\nalpha: {command: a}\nclaude: {command: my-claude}\n",
        );
        let names: Vec<String> = candidates(Role::Planner, &block)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "claude", "codex", "gemini"]);
    }

    /// Verifies a missing preferred driver falls back to one that resolves.
    #[test]
    fn falls_back_to_resolvable_driver() {
        let block = block("active_driver: fancy\nfancy: {command: fancy-agent}\n");
        let resolver = FixedResolver::new(&["codex"]);
        let (name, config) = select(Role::Executor, &block, &resolver).expect("select");
        assert_eq!(name, "codex");
        assert_eq!(config.args, vec!["exec", "--full-auto", "{query}"]);
    }

    #[test]
    fn nothing_resolvable_is_driver_unavailable() {
        let resolver = FixedResolver::new(&[]);
        let err = select(Role::Planner, &RoleSettings::default(), &resolver).unwrap_err();
        match err.downcast_ref::<OverseerError>() {
            Some(OverseerError::DriverUnavailable { role, tried }) => {
                assert_eq!(role, "brain");
                assert!(tried.contains("claude (claude)"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn voters_skip_unresolvable_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = DriverRegistry::new(
            Box::new(FixedResolver::new(&["claude"])),
            Arc::new(ManualClock::at(2025, 1, 1, 8, 0)),
            temp.path().join("brain_env"),
        );
        let block = block(
            "active_drivers: [a, b]\nvoting: majority\na: {command: claude}\nb: {command: missing}\n",
        );
        let voters = registry.build_voters(&block).expect("voters");
        assert_eq!(voters.len(), 1);
        assert_eq!(voters[0].name(), "a");
    }

    #[test]
    fn planner_uses_sandbox_home_by_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = DriverRegistry::new(
            Box::new(FixedResolver::new(&["claude"])),
            Arc::new(ManualClock::at(2025, 1, 1, 8, 0)),
            temp.path().join("brain_env"),
        );
        let home = registry
            .home_for(Role::Planner, &RoleSettings::default())
            .expect("home");
        assert_eq!(home, Some(temp.path().join("brain_env")));
        assert!(temp.path().join("brain_env").is_dir());

        let real = RoleSettings {
            use_real_home: true,
            ..RoleSettings::default()
        };
        assert_eq!(registry.home_for(Role::Planner, &real).expect("home"), None);
        assert_eq!(
            registry
                .home_for(Role::Executor, &RoleSettings::default())
                .expect("home"),
            None
        );
    }
}
