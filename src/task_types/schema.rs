//! Field schemas for task data and answer results.
//!
//! A schema lists the payload keys a task type requires. It must not claim
//! any key the pool itself owns on the abstract record, otherwise stored
//! payloads could shadow accounting fields.

use crate::tasks::model::Payload;

/// Keys owned by the abstract task record.
pub const TASK_RESERVED_FIELDS: &[&str] = &[
    "id",
    "task_type",
    "batch",
    "closed",
    "users_count",
    "users_processed",
    "users_skipped",
];

/// Keys owned by the abstract answer record.
pub const ANSWER_RESERVED_FIELDS: &[&str] = &["task", "created_by", "created_at", "task_type", "result"];

/// Which abstract record a schema extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contract {
    Task,
    Answer,
}

impl Contract {
    pub fn reserved_fields(self) -> &'static [&'static str] {
        match self {
            Contract::Task => TASK_RESERVED_FIELDS,
            Contract::Answer => ANSWER_RESERVED_FIELDS,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Contract::Task => "task",
            Contract::Answer => "answer",
        }
    }
}

/// Required payload keys for one side of a task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    contract: Contract,
    required: Vec<String>,
}

impl Schema {
    pub fn new(contract: Contract, required: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            contract,
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    /// Schema accepting any payload.
    pub fn open(contract: Contract) -> Self {
        Self {
            contract,
            required: Vec::new(),
        }
    }

    pub fn contract(&self) -> Contract {
        self.contract
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required
    }

    /// Check the schema against its abstract contract.
    pub fn check_contract(&self) -> Result<(), String> {
        let reserved = self.contract.reserved_fields();
        for field in &self.required {
            if field.trim().is_empty() {
                return Err(format!("{} schema has an empty field name", self.contract.label()));
            }
            if reserved.contains(&field.as_str()) {
                return Err(format!(
                    "{} schema field {field:?} collides with a reserved field",
                    self.contract.label()
                ));
            }
        }
        Ok(())
    }

    /// Check that `payload` carries every required key.
    pub fn check_payload(&self, payload: &Payload) -> Result<(), String> {
        match self.required.iter().find(|f| !payload.contains_key(f.as_str())) {
            Some(missing) => Err(format!("missing required field {missing:?}")),
            None => Ok(()),
        }
    }
}
