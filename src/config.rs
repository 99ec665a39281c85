//! Layered configuration for cadence.
//!
//! Settings are read from `.cadence/cadence.toml`, then overridden by the
//! environment, then by CLI flags. Every field has a default, so a missing
//! file is a valid configuration.
//!
//! ```toml
//! [agent]
//! command = "claude"
//! skip_permissions = true
//! timeout_secs = 1800
//! max_transport_retries = 3
//! backoff_initial_ms = 1000
//! backoff_max_ms = 30000
//!
//! [limits]
//! max_review_attempts = 3
//! max_simplifications = 2
//! max_implementation_continuations = 5
//! interpretation_retries = 1
//!
//! [interpreter]
//! mode = "natural_language"   # or "strict_schema"
//! classifier = "model"        # or "keyword"
//! min_description_len = 20
//!
//! [phases]
//! refinement = true
//! documentation = true
//!
//! [checkpoint]
//! dir = ".cadence/checkpoints"
//! archive_on_complete = true
//!
//! [logging]
//! level = "info"
//! json = false
//! file = true
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the per-project state directory.
pub const CADENCE_DIR: &str = ".cadence";
/// Name of the configuration file inside [`CADENCE_DIR`].
pub const CONFIG_FILE: &str = "cadence.toml";

/// Agent CLI settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_transport_retries")]
    pub max_transport_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_max_transport_retries() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            skip_permissions: true,
            timeout_secs: default_timeout_secs(),
            max_transport_retries: default_max_transport_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Bounds that turn endless loops into escalations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Revise/reject verdicts tolerated per chunk before escalating.
    #[serde(default = "default_max_review_attempts")]
    pub max_review_attempts: u32,
    /// Simplification rounds requested by the plan critique before escalating.
    #[serde(default = "default_max_simplifications")]
    pub max_simplifications: u32,
    /// "continue" verdicts tolerated per chunk before escalating.
    #[serde(default = "default_max_implementation_continuations")]
    pub max_implementation_continuations: u32,
    /// Extra interpretation attempts after the first returns nothing.
    #[serde(default = "default_interpretation_retries")]
    pub interpretation_retries: u32,
}

fn default_max_review_attempts() -> u32 {
    3
}

fn default_max_simplifications() -> u32 {
    2
}

fn default_max_implementation_continuations() -> u32 {
    5
}

fn default_interpretation_retries() -> u32 {
    1
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_review_attempts: default_max_review_attempts(),
            max_simplifications: default_max_simplifications(),
            max_implementation_continuations: default_max_implementation_continuations(),
            interpretation_retries: default_interpretation_retries(),
        }
    }
}

/// Which decision path the interpreter trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpretationMode {
    /// Keyword classification plus heuristic extraction from free text.
    #[default]
    NaturalLanguage,
    /// Agents must answer with a JSON object carrying an exact verdict.
    StrictSchema,
}

impl fmt::Display for InterpretationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NaturalLanguage => write!(f, "natural_language"),
            Self::StrictSchema => write!(f, "strict_schema"),
        }
    }
}

impl FromStr for InterpretationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "natural_language" => Ok(Self::NaturalLanguage),
            "strict_schema" => Ok(Self::StrictSchema),
            _ => anyhow::bail!(
                "Invalid interpreter mode '{}'. Valid values: natural_language, strict_schema",
                s
            ),
        }
    }
}

/// Where the stage-one keyword signal comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    /// A short classification call through the agent invoker.
    #[default]
    Model,
    /// Offline: the raw response itself is the signal.
    Keyword,
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Keyword => write!(f, "keyword"),
        }
    }
}

impl FromStr for ClassifierKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "model" => Ok(Self::Model),
            "keyword" => Ok(Self::Keyword),
            _ => anyhow::bail!("Invalid classifier '{}'. Valid values: model, keyword", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterSettings {
    #[serde(default)]
    pub mode: InterpretationMode,
    #[serde(default)]
    pub classifier: ClassifierKind,
    /// Shortest sentence accepted as a fallback description.
    #[serde(default = "default_min_description_len")]
    pub min_description_len: usize,
}

fn default_min_description_len() -> usize {
    20
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self {
            mode: InterpretationMode::default(),
            classifier: ClassifierKind::default(),
            min_description_len: default_min_description_len(),
        }
    }
}

/// Optional phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseToggles {
    #[serde(default = "default_true")]
    pub refinement: bool,
    #[serde(default = "default_true")]
    pub documentation: bool,
}

impl Default for PhaseToggles {
    fn default() -> Self {
        Self {
            refinement: true,
            documentation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// Relative paths resolve against the project directory.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_true")]
    pub archive_on_complete: bool,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(CADENCE_DIR).join("checkpoints")
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            archive_on_complete: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_true")]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: true,
        }
    }
}

/// Parsed `cadence.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CadenceToml {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub interpreter: InterpreterSettings,
    #[serde(default)]
    pub phases: PhaseToggles,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl CadenceToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cadence.toml")
    }

    /// Load `<cadence_dir>/cadence.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(cadence_dir: &Path) -> Result<Self> {
        let config_path = cadence_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize cadence.toml")
    }

    /// Apply environment overrides through a lookup function.
    ///
    /// Recognised keys: `CADENCE_AGENT_CMD`, `CADENCE_SKIP_PERMISSIONS`,
    /// `CADENCE_LOG_LEVEL`.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cmd) = lookup("CADENCE_AGENT_CMD").filter(|c| !c.trim().is_empty()) {
            self.agent.command = cmd;
        }
        if let Some(skip) = lookup("CADENCE_SKIP_PERMISSIONS") {
            self.agent.skip_permissions = skip != "false" && skip != "0";
        }
        if let Some(level) = lookup("CADENCE_LOG_LEVEL").filter(|l| !l.trim().is_empty()) {
            self.logging.level = level;
        }
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Problems that make the configuration unusable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.agent.command.trim().is_empty() {
            problems.push("agent.command must not be empty".to_string());
        }
        if self.agent.timeout_secs == 0 {
            problems.push("agent.timeout_secs must be greater than zero".to_string());
        }
        if self.agent.backoff_initial_ms > self.agent.backoff_max_ms {
            problems.push(format!(
                "agent.backoff_initial_ms ({}) exceeds agent.backoff_max_ms ({})",
                self.agent.backoff_initial_ms, self.agent.backoff_max_ms
            ));
        }
        if self.limits.max_review_attempts == 0 {
            problems.push("limits.max_review_attempts must be at least 1".to_string());
        }
        if self.limits.max_implementation_continuations == 0 {
            problems.push("limits.max_implementation_continuations must be at least 1".to_string());
        }
        if self.limits.interpretation_retries == 0 {
            problems.push("limits.interpretation_retries must be at least 1".to_string());
        }
        if self.agent.max_transport_retries == 0 {
            problems.push("agent.max_transport_retries must be at least 1".to_string());
        }

        problems
    }
}

/// Resolved runtime configuration for one project.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub cadence_dir: PathBuf,
    pub toml: CadenceToml,
    pub verbose: bool,
    pub non_interactive: bool,
}

impl Config {
    /// Load file and environment layers for a project directory.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let cadence_dir = project_dir.join(CADENCE_DIR);
        let mut toml = CadenceToml::load_or_default(&cadence_dir)?;
        toml.apply_env();

        let problems = toml.validate();
        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
        }

        Ok(Self {
            project_dir,
            cadence_dir,
            toml,
            verbose: false,
            non_interactive: false,
        })
    }

    /// Apply CLI overrides.
    pub fn with_cli_args(mut self, verbose: bool, non_interactive: bool) -> Self {
        self.verbose = verbose;
        self.non_interactive = non_interactive;
        if verbose {
            self.toml.logging.level = "debug".to_string();
        }
        self
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        if self.toml.checkpoint.dir.is_absolute() {
            self.toml.checkpoint.dir.clone()
        } else {
            self.project_dir.join(&self.toml.checkpoint.dir)
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.cadence_dir.join("logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.checkpoint_dir())
            .context("Failed to create checkpoint directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }
}
