//! Configuration types.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Batch id that later imports may keep extending.
    pub default_batch: String,
    /// Records per import chunk.
    pub import_chunk_size: usize,
    /// Optimistic retries for one `complete` call before giving up.
    pub complete_max_attempts: u32,
    /// JSON file declaring the task types.
    pub task_types_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/taskpool.db"),
            default_batch: "default".to_string(),
            import_chunk_size: 100,
            complete_max_attempts: 16,
            task_types_path: None,
        }
    }
}

impl PoolConfig {
    /// Read overrides from `TASKPOOL_*` environment variables.
    ///
    /// Unparseable numbers keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("TASKPOOL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            default_batch: std::env::var("TASKPOOL_DEFAULT_BATCH")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.default_batch),
            import_chunk_size: std::env::var("TASKPOOL_IMPORT_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.import_chunk_size),
            complete_max_attempts: std::env::var("TASKPOOL_COMPLETE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.complete_max_attempts),
            task_types_path: std::env::var("TASKPOOL_TASK_TYPES").ok().map(PathBuf::from),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_batch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TASKPOOL_DEFAULT_BATCH".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.import_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKPOOL_IMPORT_CHUNK_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.complete_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKPOOL_COMPLETE_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Load the declared task types.
    pub fn load_task_types(&self) -> Result<Vec<TaskTypeConfig>, ConfigError> {
        let path = self
            .task_types_path
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "TASKPOOL_TASK_TYPES".to_string(),
                hint: "Point it at a JSON file listing the task types.".to_string(),
            })?;
        load_task_types(path)
    }
}

/// One task type as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskTypeConfig {
    pub type_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub template: String,
    /// Distinct answers required before a task closes.
    #[serde(default = "default_redundancy")]
    pub redundancy: u32,
    /// Keys every imported record must carry.
    #[serde(default)]
    pub task_fields: Vec<String>,
    /// Keys every submitted answer must carry.
    #[serde(default)]
    pub answer_fields: Vec<String>,
}

fn default_redundancy() -> u32 {
    1
}

/// Parse a JSON array of task type declarations.
pub fn parse_task_types(json: &str) -> Result<Vec<TaskTypeConfig>, ConfigError> {
    serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Read and parse a task type file.
pub fn load_task_types(path: &Path) -> Result<Vec<TaskTypeConfig>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_task_types(&content)
}
