//! TOML-based configuration for arbor repositories.
//!
//! Every section and field has a default, so an empty file is a valid
//! in-memory configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::models::{MergeStrategy, Signature};
use crate::refs::validate_branch_name;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level repository configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArborConfig {
    /// Persistence backend selection.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Branch naming and locking.
    #[serde(default)]
    pub branches: BranchesConfig,

    /// Commit graph traversal limits.
    #[serde(default)]
    pub ancestry: AncestryConfig,

    /// Merge engine behaviour.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Author recorded on commits the repository writes itself.
    #[serde(default)]
    pub identity: IdentityConfig,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Which persistence backend to use.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on drop.
    #[default]
    Memory,
    /// SQLite database file.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database file, used by the sqlite backend. Default `arbor.db`.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("arbor.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchesConfig {
    /// Branch that can never be deleted. Default `main`.
    #[serde(default = "default_branch_name")]
    pub default_branch: String,

    /// Longest wait for a branch lock, in milliseconds (default 5000).
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_branch_name() -> String {
    "main".into()
}
fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Default for BranchesConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch_name(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl BranchesConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Ancestry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AncestryConfig {
    /// Most commits a single traversal may visit before the graph is
    /// treated as cyclic (default 100000).
    #[serde(default = "default_max_traversal")]
    pub max_traversal: usize,
}

fn default_max_traversal() -> usize {
    100_000
}

impl Default for AncestryConfig {
    fn default() -> Self {
        Self {
            max_traversal: default_max_traversal(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MergeConfig {
    /// Strategy used by `Repository::merge_default`.
    #[serde(default)]
    pub default_strategy: MergeStrategy,

    /// Move the target straight to the source head when the target has no
    /// commits of its own.
    #[serde(default)]
    pub allow_fast_forward: bool,

    /// Glob patterns for paths holding definition objects. Conflicts on
    /// matching paths are always major.
    #[serde(default)]
    pub structural_patterns: Vec<String>,
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_name")]
    pub name: String,

    #[serde(default = "default_identity_email")]
    pub email: String,
}

fn default_identity_name() -> String {
    "arbor".into()
}
fn default_identity_email() -> String {
    "arbor@localhost".into()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            email: default_identity_email(),
        }
    }
}

impl IdentityConfig {
    pub fn signature(&self) -> Signature {
        Signature::new(self.name.clone(), self.email.clone())
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl ArborConfig {
    /// Load and parse a TOML configuration file.
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

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.branches.default_branch.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "branches.default_branch".into(),
                detail: "default branch must not be empty".into(),
            });
        }
        if validate_branch_name(&self.branches.default_branch).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "branches.default_branch".into(),
                detail: format!("'{}' is not a valid branch name", self.branches.default_branch),
            });
        }
        if self.branches.lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "branches.lock_timeout_ms".into(),
                detail: "lock timeout must be > 0".into(),
            });
        }
        if self.ancestry.max_traversal == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ancestry.max_traversal".into(),
                detail: "traversal bound must be > 0".into(),
            });
        }
        if self.storage.backend == StorageBackend::Sqlite
            && self.storage.path.as_os_str().is_empty()
        {
            return Err(ConfigError::InvalidValue {
                field: "storage.path".into(),
                detail: "sqlite backend requires a database path".into(),
            });
        }
        if let Some(pattern) = self.merge.structural_patterns.iter().find(|p| p.is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "merge.structural_patterns".into(),
                detail: format!("empty pattern {pattern:?}"),
            });
        }
        if self.identity.name.is_empty() || self.identity.email.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "identity".into(),
                detail: "name and email must not be empty".into(),
            });
        }
        Ok(())
    }
}
