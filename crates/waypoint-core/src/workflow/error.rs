//! Engine-level error type.

use thiserror::Error;
use uuid::Uuid;
use waypoint_types::error::{DefinitionError, RepositoryError};

/// Errors surfaced by the workflow manager and its components.
///
/// Step failures are not errors at this level: they become a `Failed`
/// status with an inspectable cause on the instance record.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("journal error: {0}")]
    Journal(#[from] RepositoryError),

    #[error("invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    #[error("workflow {0} has not reached a terminal status")]
    NotTerminal(Uuid),

    /// The completion handler failed. The record is retained with
    /// `delivery = callback_failed`.
    #[error("completion handler failed for workflow {workflow_id}: {message}")]
    Callback { workflow_id: Uuid, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_display() {
        let err = EngineError::from(RepositoryError::NotFound);
        assert_eq!(err.to_string(), "journal error: entity not found");

        let err = EngineError::from(DefinitionError::EmptyName);
        assert!(err.to_string().starts_with("invalid workflow definition"));

        let id = Uuid::nil();
        let err = EngineError::Callback {
            workflow_id: id,
            message: "mailer down".to_string(),
        };
        assert!(err.to_string().contains("mailer down"));
        assert!(err.to_string().contains(&id.to_string()));
    }
}
