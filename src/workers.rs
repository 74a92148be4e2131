//! Worker references — authenticated users are owned elsewhere; the pool
//! only needs their id and group memberships.

use serde::{Deserialize, Serialize};

/// Permission group. A worker may work on every type listed in any of its groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allowed_types: Vec<String>,
}

impl Group {
    pub fn new(id: impl Into<String>, allowed_types: &[&str]) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            allowed_types: allowed_types.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// A worker as seen by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl Worker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            groups: Vec::new(),
        }
    }

    /// Builder: add a group membership.
    pub fn with_group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    /// Check that the worker may work with tasks of `task_type`.
    ///
    /// An empty type name is never eligible.
    pub fn is_eligible_for(&self, task_type: &str) -> bool {
        if task_type.is_empty() {
            return false;
        }
        self.groups
            .iter()
            .flat_map(|g| g.allowed_types.iter())
            .any(|t| t == task_type)
    }
}
