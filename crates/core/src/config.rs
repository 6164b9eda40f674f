//! TOML-based configuration for a versioned table repository.
//!
//! Every section and field has a serde default, so an empty file (or no file
//! at all, via [`AppConfig::default`]) yields a usable configuration. A small
//! set of policy switches can be overridden from the environment with
//! [`AppConfig::apply_env_overrides`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

/// Environment variable overriding `logging.level`.
pub const ENV_LOG_LEVEL: &str = "VTAB_LOG_LEVEL";
/// Environment variable overriding `transaction.allow_commit_conflicts`.
pub const ENV_ALLOW_COMMIT_CONFLICTS: &str = "VTAB_ALLOW_COMMIT_CONFLICTS";
/// Environment variable overriding `transaction.force_transaction_commit`.
pub const ENV_FORCE_TRANSACTION_COMMIT: &str = "VTAB_FORCE_TRANSACTION_COMMIT";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Branch naming and commit identity defaults.
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Tracing output.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Row diff behaviour.
    #[serde(default)]
    pub diff: DiffConfig,

    /// Merge behaviour.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Commit-time policy.
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// History materialisation.
    #[serde(default)]
    pub history: HistoryConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Branch created by [`Repository::init`](crate::Repository::init).
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Author recorded when a commit does not name one.
    #[serde(default = "default_author")]
    pub default_author: String,

    #[serde(default = "default_email")]
    pub default_email: String,
}

fn default_branch() -> String {
    "main".into()
}
fn default_author() -> String {
    "vtab".into()
}
fn default_email() -> String {
    "vtab@localhost".into()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            default_author: default_author(),
            default_email: default_email(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level or an `EnvFilter` directive string.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Distinct coercion warnings kept per diff; further ones are counted.
    #[serde(default = "default_max_warnings")]
    pub max_warnings: usize,
}

fn default_max_warnings() -> usize {
    32
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            max_warnings: default_max_warnings(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Re-check constraints against the merged data.
    #[serde(default = "default_true")]
    pub validate_constraints: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            validate_constraints: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Permit committing a working set that carries merge conflicts.
    #[serde(default)]
    pub allow_commit_conflicts: bool,

    /// Permit committing a working set that carries constraint violations.
    #[serde(default)]
    pub force_transaction_commit: bool,

    /// Compare-and-swap attempts on the branch tip before giving up.
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,
}

fn default_max_commit_retries() -> u32 {
    5
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            allow_commit_conflicts: false,
            force_transaction_commit: false,
            max_commit_retries: default_max_commit_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Worker threads used to diff ancestor commits.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_parallelism() -> usize {
    4
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** apply environment overrides; call
    /// [`apply_env_overrides`](Self::apply_env_overrides) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Override policy switches from `VTAB_*` environment variables.
    ///
    /// Unparseable boolean values are rejected rather than ignored.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(level) = read_env(ENV_LOG_LEVEL) {
            debug!(level = %level, "log level overridden from environment");
            self.logging.level = level;
        }
        if let Some(raw) = read_env(ENV_ALLOW_COMMIT_CONFLICTS) {
            self.transaction.allow_commit_conflicts =
                parse_bool(&raw, "transaction.allow_commit_conflicts")?;
        }
        if let Some(raw) = read_env(ENV_FORCE_TRANSACTION_COMMIT) {
            self.transaction.force_transaction_commit =
                parse_bool(&raw, "transaction.force_transaction_commit")?;
        }
        Ok(())
    }

    /// Validate that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.default_branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.default_branch".into(),
                detail: "default branch must not be empty".into(),
            });
        }
        if self.diff.max_warnings == 0 {
            return Err(ConfigError::InvalidValue {
                field: "diff.max_warnings".into(),
                detail: "must be > 0".into(),
            });
        }
        if self.transaction.max_commit_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transaction.max_commit_retries".into(),
                detail: "must be > 0".into(),
            });
        }
        if self.history.parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                field: "history.parallelism".into(),
                detail: "must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, override, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

fn read_env(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => Some(val.trim().to_string()),
        Ok(_) => {
            warn!(env_name = name, "env var is set but empty, ignoring");
            None
        }
        Err(_) => None,
    }
}

fn parse_bool(raw: &str, field: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.into(),
            detail: format!("'{raw}' is not a boolean"),
        }),
    }
}
