use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::task::TaskSpec;
use crate::{Error, Result};

/// What happens to the rest of the graph when a task fails or times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel the failed task's transitive dependents; independent branches
    /// keep running.
    #[default]
    CascadeCancel,
    /// Cancel every non-terminal task on the first failure.
    FailFast,
}

/// On-disk configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sessions_dir: Option<String>,
    pub max_sessions: usize,
    pub timeout_factor: f64,
    pub hang_factor: f64,
    pub hang_threshold_secs: Option<u64>,
    pub min_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub poll_interval_ms: u64,
    pub cost_unit_ms: u64,
    pub archive_on_destroy: bool,
    pub history_limit: usize,
    pub failure_policy: FailurePolicy,
    pub memory_budget_mb: Option<u64>,
    pub shell: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sessions_dir: None,
            max_sessions: 4,
            timeout_factor: 3.0,
            hang_factor: 2.0,
            hang_threshold_secs: None,
            min_timeout_ms: 1000,
            grace_period_ms: 2000,
            poll_interval_ms: 1000,
            cost_unit_ms: 1000,
            archive_on_destroy: false,
            history_limit: 20,
            failure_policy: FailurePolicy::CascadeCancel,
            memory_budget_mb: None,
            shell: "sh".to_string(),
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields defaults; a missing explicit file is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::config_path()?, false),
        };
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            if explicit {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be at least 1".into()));
        }
        for (name, value) in [
            ("timeout_factor", self.timeout_factor),
            ("hang_factor", self.hang_factor),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Config(format!("{name} must be positive, got {value}")));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".into()));
        }
        if self.shell.trim().is_empty() {
            return Err(Error::Config("shell must not be empty".into()));
        }
        Ok(())
    }

    pub fn sessions_root(&self) -> Result<PathBuf> {
        match &self.sessions_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("sessions")),
        }
    }

    pub fn timing(&self) -> Timing {
        Timing {
            cost_unit: Duration::from_millis(self.cost_unit_ms),
            timeout_factor: self.timeout_factor,
            hang_factor: self.hang_factor,
            hang_threshold: self.hang_threshold_secs.map(Duration::from_secs),
            min_timeout: Duration::from_millis(self.min_timeout_ms),
        }
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            root: self.sessions_root()?,
            max_sessions: self.max_sessions,
            shell: self.shell.clone(),
            grace_period: Duration::from_millis(self.grace_period_ms),
            archive_on_destroy: self.archive_on_destroy,
            history_limit: self.history_limit,
            timing: self.timing(),
        })
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            concurrency_limit: self.max_sessions,
            memory_budget_mb: self.memory_budget_mb,
            failure_policy: self.failure_policy,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            sessions: self.session_config()?,
        })
    }
}

/// Converts unitless cost estimates into wall-clock limits.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub cost_unit: Duration,
    pub timeout_factor: f64,
    pub hang_factor: f64,
    /// Fixed hang threshold; when unset it scales with the estimate.
    pub hang_threshold: Option<Duration>,
    pub min_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Config::default().timing()
    }
}

impl Timing {
    fn scaled(&self, cost: f64, factor: f64) -> Duration {
        let secs = self.cost_unit.as_secs_f64() * cost.max(0.0) * factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn estimate(&self, task: &TaskSpec) -> Duration {
        self.scaled(task.estimated_cost, 1.0)
    }

    pub fn timeout_for(&self, task: &TaskSpec) -> Duration {
        task.timeout_override().unwrap_or_else(|| {
            self.scaled(task.estimated_cost, self.timeout_factor)
                .max(self.min_timeout)
        })
    }

    /// Output silence tolerated before a session counts as hung.
    ///
    /// A scaled threshold never undercuts the cost-derived deadline, so a
    /// quiet task is only flagged as hung once it has outlived the time it
    /// was budgeted. A fixed `hang_threshold` is taken as given.
    pub fn hang_threshold_for(&self, task: &TaskSpec) -> Duration {
        self.hang_threshold.unwrap_or_else(|| {
            let hang = self.scaled(task.estimated_cost, self.hang_factor);
            let deadline = self.scaled(task.estimated_cost, self.timeout_factor);
            hang.max(deadline).max(self.min_timeout)
        })
    }
}

/// Explicit configuration for a [`SessionManager`](crate::session::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub root: PathBuf,
    pub max_sessions: usize,
    pub shell: String,
    pub grace_period: Duration,
    pub archive_on_destroy: bool,
    pub history_limit: usize,
    pub timing: Timing,
}

impl SessionConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let defaults = Config::default();
        let timing = defaults.timing();
        Self {
            root: root.into(),
            max_sessions: defaults.max_sessions,
            shell: defaults.shell,
            grace_period: Duration::from_millis(defaults.grace_period_ms),
            archive_on_destroy: defaults.archive_on_destroy,
            history_limit: defaults.history_limit,
            timing,
        }
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }
}

/// Explicit configuration for a [`Scheduler`](crate::orchestration::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency_limit: usize,
    pub memory_budget_mb: Option<u64>,
    pub failure_policy: FailurePolicy,
    pub poll_interval: Duration,
    pub sessions: SessionConfig,
}

impl SchedulerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let defaults = Config::default();
        Self {
            concurrency_limit: defaults.max_sessions,
            memory_budget_mb: defaults.memory_budget_mb,
            failure_policy: defaults.failure_policy,
            poll_interval: Duration::from_millis(defaults.poll_interval_ms),
            sessions: SessionConfig::new(root),
        }
    }

    /// Set the concurrency cap for both the scheduler and its session manager.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self.sessions.max_sessions = limit;
        self
    }

    pub fn timing(&self) -> &Timing {
        &self.sessions.timing
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
