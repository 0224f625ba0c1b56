use thiserror::Error;

/// Errors from repository operations (used by trait definitions in waypoint-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised when validating a workflow definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("step '{step}' (index {index}) has no handler reference")]
    MissingHandler { step: String, index: u32 },

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_definition_error_display() {
        let err = DefinitionError::MissingHandler {
            step: "run".to_string(),
            index: 1,
        };
        assert_eq!(err.to_string(), "step 'run' (index 1) has no handler reference");
    }
}
