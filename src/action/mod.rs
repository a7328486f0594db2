//! Replicated Actions
//!
//! An [`Action`] is an immutable description of one mutating operation plus
//! a shared outcome flag. Clones of an action share that flag, so whoever
//! enqueued it can observe when the owning member's worker applied it.
//! Use [`Action::duplicate`] to hand the same operation to another member.

mod operation;
mod value;

pub use operation::{ColumnDef, Operation, TableDescriptor};
pub use value::{Row, Value};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

#[derive(Debug, Default)]
struct Outcome {
    attempted: AtomicBool,
    succeeded: AtomicBool,
}

/// One replayable mutating operation
#[derive(Debug, Clone)]
pub struct Action {
    id: Uuid,
    label: String,
    operation: Arc<Operation>,
    created_at: chrono::DateTime<chrono::Utc>,
    outcome: Arc<Outcome>,
}

impl Action {
    /// Create a new action; the label is used for logging only
    pub fn new(label: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            operation: Arc::new(operation),
            created_at: chrono::Utc::now(),
            outcome: Arc::new(Outcome::default()),
        }
    }

    /// Create an action labelled after its operation
    pub fn from_operation(operation: Operation) -> Self {
        let label = match operation.table_name() {
            Some(table) => format!("{} {}", operation.kind(), table),
            None => operation.kind().to_string(),
        };
        Self::new(label, operation)
    }

    /// Copy of this action for another member, with its own id and outcome
    pub fn duplicate(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: self.label.clone(),
            operation: Arc::clone(&self.operation),
            created_at: self.created_at,
            outcome: Arc::new(Outcome::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    /// Whether a worker applied this action successfully
    pub fn succeeded(&self) -> bool {
        self.outcome.succeeded.load(Ordering::Acquire)
    }

    /// Whether a worker has tried to apply this action (successfully or not)
    pub fn attempted(&self) -> bool {
        self.outcome.attempted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_attempted(&self) {
        self.outcome.attempted.store(true, Ordering::Release);
    }

    pub(crate) fn mark_succeeded(&self) {
        self.outcome.succeeded.store(true, Ordering::Release);
    }

    /// Reset the attempt marker before handing the action back to a queue
    pub(crate) fn reset_attempt(&self) {
        self.outcome.attempted.store(false, Ordering::Release);
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.label, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert() -> Operation {
        Operation::Insert {
            table: "users".into(),
            columns: vec!["id".into()],
            values: vec![Value::Int(1)],
        }
    }

    #[test]
    fn test_clones_share_outcome() {
        let action = Action::from_operation(insert());
        let handle = action.clone();
        assert!(!handle.succeeded());

        action.mark_attempted();
        action.mark_succeeded();
        assert!(handle.attempted());
        assert!(handle.succeeded());
    }

    #[test]
    fn test_duplicate_has_fresh_outcome() {
        let action = Action::from_operation(insert());
        action.mark_succeeded();

        let copy = action.duplicate();
        assert_ne!(copy.id(), action.id());
        assert!(!copy.succeeded());
        assert_eq!(copy.label(), "insert users");
    }
}
