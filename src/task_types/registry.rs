//! Registry of task types.
//!
//! Built once from configuration at startup, then read-only. Every
//! registration is checked up front so a bad declaration stops the process
//! before any request is served.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::config::TaskTypeConfig;
use crate::error::ConfigError;
use crate::tasks::model::Payload;
use crate::task_types::schema::{Contract, Schema};
use crate::workers::Worker;

static REGISTRY: OnceLock<Arc<TaskTypeRegistry>> = OnceLock::new();

/// A named family of tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskType {
    pub type_name: String,
    pub name: String,
    pub description: String,
    /// Rendering template identifier.
    pub template: String,
    /// Distinct answers required to close a task.
    pub redundancy: u32,
    pub task_schema: Schema,
    pub answer_schema: Schema,
}

impl TaskType {
    pub fn new(type_name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: String::new(),
            description: String::new(),
            template: template.into(),
            redundancy: 1,
            task_schema: Schema::open(Contract::Task),
            answer_schema: Schema::open(Contract::Answer),
        }
    }

    pub fn from_config(config: &TaskTypeConfig) -> Self {
        Self {
            type_name: config.type_name.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            template: config.template.clone(),
            redundancy: config.redundancy,
            task_schema: Schema::new(Contract::Task, config.task_fields.iter().cloned()),
            answer_schema: Schema::new(Contract::Answer, config.answer_fields.iter().cloned()),
        }
    }

    /// Builder: set the number of answers required per task.
    pub fn with_redundancy(mut self, redundancy: u32) -> Self {
        self.redundancy = redundancy;
        self
    }

    /// Builder: require keys on imported task data.
    pub fn with_task_fields(mut self, fields: &[&str]) -> Self {
        self.task_schema = Schema::new(Contract::Task, fields.iter().copied());
        self
    }

    /// Builder: require keys on submitted answers.
    pub fn with_answer_fields(mut self, fields: &[&str]) -> Self {
        self.answer_schema = Schema::new(Contract::Answer, fields.iter().copied());
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTaskType {
            type_name: self.type_name.clone(),
            reason,
        };

        if self.type_name.trim().is_empty() {
            return Err(invalid("type_name must be set".to_string()));
        }
        if self.template.trim().is_empty() {
            return Err(invalid("template must be set".to_string()));
        }
        if self.redundancy == 0 {
            return Err(invalid("redundancy must be at least 1".to_string()));
        }
        if self.task_schema.contract() != Contract::Task
            || self.answer_schema.contract() != Contract::Answer
        {
            return Err(invalid("schemas bound to the wrong contract".to_string()));
        }
        self.task_schema.check_contract().map_err(invalid)?;
        self.answer_schema.check_contract().map_err(invalid)?;
        Ok(())
    }
}

/// Serialized description of a task type for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskTypeSummary {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: String,
    /// Stored tasks of this type.
    pub tasks: u64,
}

/// Shared handle to a registered task type.
#[derive(Debug, Clone)]
pub struct TaskTypeHandle(Arc<TaskType>);

impl TaskTypeHandle {
    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    pub fn template(&self) -> &str {
        &self.0.template
    }

    pub fn redundancy(&self) -> u32 {
        self.0.redundancy
    }

    pub fn task_type(&self) -> &TaskType {
        &self.0
    }

    pub fn is_eligible(&self, worker: &Worker) -> bool {
        worker.is_eligible_for(&self.0.type_name)
    }

    pub fn validate_task_data(&self, data: &Payload) -> Result<(), String> {
        self.0.task_schema.check_payload(data)
    }

    pub fn validate_answer(&self, result: &Payload) -> Result<(), String> {
        self.0.answer_schema.check_payload(result)
    }

    pub fn summary(&self, tasks: u64) -> TaskTypeSummary {
        TaskTypeSummary {
            name: self.0.name.clone(),
            description: self.0.description.clone(),
            task_type: self.0.type_name.clone(),
            tasks,
        }
    }
}

/// Registry of task types keyed by `type_name`.
#[derive(Debug, Default)]
pub struct TaskTypeRegistry {
    types: BTreeMap<String, TaskTypeHandle>,
}

impl TaskTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from declarations, failing on the first bad one.
    pub fn from_configs(configs: &[TaskTypeConfig]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(TaskType::from_config(config))?;
        }
        Ok(registry)
    }

    /// Register a task type.
    pub fn register(&mut self, task_type: TaskType) -> Result<TaskTypeHandle, ConfigError> {
        task_type.validate()?;
        if self.types.contains_key(&task_type.type_name) {
            return Err(ConfigError::DuplicateTaskType(task_type.type_name));
        }
        let handle = TaskTypeHandle(Arc::new(task_type));
        self.types
            .insert(handle.type_name().to_string(), handle.clone());
        tracing::debug!(task_type = %handle.type_name(), "Registered task type");
        Ok(handle)
    }

    pub fn resolve(&self, type_name: &str) -> Option<TaskTypeHandle> {
        self.types.get(type_name).cloned()
    }

    /// Resolve a type only if the worker may work on it.
    pub fn resolve_for(&self, type_name: &str, worker: &Worker) -> Option<TaskTypeHandle> {
        self.resolve(type_name).filter(|h| h.is_eligible(worker))
    }

    /// Registered type names the worker may work on.
    pub fn eligible_types(&self, worker: &Worker) -> Vec<String> {
        self.types
            .values()
            .filter(|h| h.is_eligible(worker))
            .map(|h| h.type_name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Install the process-wide registry. Allowed once per process.
pub fn install(registry: TaskTypeRegistry) -> Result<Arc<TaskTypeRegistry>, ConfigError> {
    let registry = Arc::new(registry);
    REGISTRY
        .set(registry.clone())
        .map_err(|_| ConfigError::RegistryAlreadyInstalled)?;
    tracing::info!(types = registry.len(), "Task type registry installed");
    Ok(registry)
}

/// The process-wide registry, if installed.
pub fn global() -> Option<Arc<TaskTypeRegistry>> {
    REGISTRY.get().cloned()
}
