//! Configuration parsing and validation
//!
//! This module handles loading the Conflux project file.
//!
//! # Configuration Files
//!
//! - `conflux.yaml` - Project root configuration (resilience, run defaults, schemas)
//! - `sources/*.yaml`, `destinations/*.yaml` - Definitions (YAML or JSON)
//! - `workflows/*.yaml` - Workflow documents
//!
//! ```yaml
//! name: my-project
//! resilience:
//!   maxAttempts: 3
//!   baseDelayMs: 200
//!   timeoutMs: 30000
//!   failureThreshold: 5
//!   coolDownMs: 30000
//!   targets:
//!     "RestApi:http:https://api.example.com/orders": { maxAttempts: 5 }
//! pipeline:
//!   batchSize: 500
//! workflow:
//!   maxStepExecutions: 1000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::schema::{Schema, SchemaCatalog};

/// Name of the project file
pub const CONFIG_FILE: &str = "conflux.yaml";

/// Root project configuration from `conflux.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Project name
    pub name: String,

    /// Project version
    #[serde(default = "default_version")]
    pub version: String,

    /// Retry, breaker and timeout settings
    #[serde(default)]
    pub resilience: ResilienceSettings,

    /// Pipeline run defaults
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Workflow run defaults
    #[serde(default)]
    pub workflow: WorkflowSettings,

    /// Resolved schemas available to validation
    #[serde(default)]
    pub schemas: Vec<Schema>,

    /// Global variables merged into every workflow context
    #[serde(default)]
    pub vars: HashMap<String, serde_json::Value>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// Resilience settings; durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceSettings {
    /// Attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Extra random delay as a fraction of the backoff (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Per-attempt timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures that open a breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open breaker rejects calls
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,

    /// Overrides keyed by target identity
    #[serde(default)]
    pub targets: BTreeMap<String, ResilienceOverrides>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cool_down_ms() -> u64 {
    30_000
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            cool_down_ms: default_cool_down_ms(),
            targets: BTreeMap::new(),
        }
    }
}

impl ResilienceSettings {
    /// Settings for a target, with its overrides applied
    pub fn for_target(&self, target: &str) -> ResilienceSettings {
        let mut settings = self.clone();
        settings.targets.clear();
        if let Some(o) = self.targets.get(target) {
            settings.max_attempts = o.max_attempts.unwrap_or(settings.max_attempts);
            settings.base_delay_ms = o.base_delay_ms.unwrap_or(settings.base_delay_ms);
            settings.max_delay_ms = o.max_delay_ms.unwrap_or(settings.max_delay_ms);
            settings.jitter = o.jitter.unwrap_or(settings.jitter);
            settings.timeout_ms = o.timeout_ms.unwrap_or(settings.timeout_ms);
            settings.failure_threshold = o.failure_threshold.unwrap_or(settings.failure_threshold);
            settings.cool_down_ms = o.cool_down_ms.unwrap_or(settings.cool_down_ms);
        }
        settings
    }

    /// Reject settings that would make every call fail or never stop
    pub fn validate(&self) -> Result<()> {
        let all = std::iter::once(self.clone())
            .chain(self.targets.keys().map(|t| self.for_target(t)));
        for settings in all {
            if settings.max_attempts == 0 {
                return Err(Error::config("resilience.maxAttempts must be at least 1"));
            }
            if settings.failure_threshold == 0 {
                return Err(Error::config("resilience.failureThreshold must be at least 1"));
            }
            if settings.timeout_ms == 0 {
                return Err(Error::config("resilience.timeoutMs must be greater than 0"));
            }
            if !(0.0..=1.0).contains(&settings.jitter) {
                return Err(Error::config("resilience.jitter must be between 0 and 1"));
            }
        }
        Ok(())
    }
}

/// Per-target resilience overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceOverrides {
    /// Attempts per call
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Backoff before the second attempt
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    /// Backoff ceiling
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    /// Jitter fraction
    #[serde(default)]
    pub jitter: Option<f64>,
    /// Per-attempt timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Breaker threshold
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    /// Breaker cool-down
    #[serde(default)]
    pub cool_down_ms: Option<u64>,
}

/// Pipeline run defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    /// Records per destination write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Skip failing records instead of aborting
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_batch_size() -> usize {
    500
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            continue_on_error: false,
        }
    }
}

/// Workflow run defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// Step executions allowed per run before it fails
    #[serde(default = "default_max_step_executions")]
    pub max_step_executions: usize,
}

fn default_max_step_executions() -> usize {
    1000
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_step_executions: default_max_step_executions(),
        }
    }
}

/// Main configuration container
#[derive(Debug, Clone)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// Base path of the project
    pub base_path: PathBuf,
}

impl Config {
    /// Load configuration from a directory
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the project directory or conflux.yaml file
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let config = Config::load("./my-project")?;
    /// println!("Project: {}", config.project.name);
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let (config_path, base_path) = if path.is_dir() {
            (path.join(CONFIG_FILE), path.to_path_buf())
        } else {
            (
                path.to_path_buf(),
                path.parent().unwrap_or(Path::new(".")).to_path_buf(),
            )
        };

        if !config_path.exists() {
            return Err(Error::ConfigNotFound {
                path: config_path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(&config_path)?;
        let project: ProjectConfig = serde_yaml::from_str(&contents)?;
        project.resilience.validate()?;

        Ok(Self { project, base_path })
    }

    /// Defaults for running without a project file
    pub fn standalone(base_path: impl Into<PathBuf>) -> Self {
        Self {
            project: ProjectConfig {
                name: "standalone".to_string(),
                version: default_version(),
                resilience: ResilienceSettings::default(),
                pipeline: PipelineSettings::default(),
                workflow: WorkflowSettings::default(),
                schemas: Vec::new(),
                vars: HashMap::new(),
            },
            base_path: base_path.into(),
        }
    }

    /// Schemas declared in the project, keyed by id
    pub fn schema_catalog(&self) -> SchemaCatalog {
        self.project.schemas.iter().cloned().collect()
    }

    /// Resolve a project-relative path
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_relative() {
            self.base_path.join(path)
        } else {
            path.to_path_buf()
        }
    }

    /// Paths of every YAML/JSON document in a project subdirectory, sorted
    pub fn documents(&self, dir: &str) -> Result<Vec<PathBuf>> {
        let dir = self.base_path.join(dir);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}
