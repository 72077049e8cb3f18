use keystone_core::CoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Unknown research opportunity: {0}")]
    UnknownOpportunity(String),

    #[error("Inconsistent scheduler state: {0}")]
    InconsistentState(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("Research worker failed: {0}")]
    Worker(String),

    #[error("Research worker timed out after {secs}s")]
    WorkerTimeout { secs: u64 },

    #[error("Malformed worker response: {0}")]
    MalformedResponse(String),

    #[error("Unresolved research conflicts: {}", .0.join("; "))]
    UnresolvedConflicts(Vec<String>),

    #[error("Unresolved research gaps: {}", .0.join("; "))]
    UnresolvedGaps(Vec<String>),

    #[error("Research not ready: {0}")]
    ResearchNotReady(String),

    #[error("Task executor failed: {0}")]
    ExecutionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<CoreError> for OrchestratorError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::UnknownOpportunity(id) => Self::UnknownOpportunity(id),
            CoreError::InvalidStatusTransition { from, to } => Self::InvalidTransition { from, to },
            CoreError::InvalidPlan(reason) => Self::InvalidPlan(reason),
            CoreError::Validation(reason) => Self::InvalidPlan(reason),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl OrchestratorError {
    /// Contract violations are fatal and must never be retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::UnknownOpportunity(_) | Self::TaskNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_map_to_orchestrator_errors() {
        let error: OrchestratorError = CoreError::UnknownOpportunity("STACK_GPU".into()).into();
        assert!(matches!(error, OrchestratorError::UnknownOpportunity(ref id) if id == "STACK_GPU"));
        assert!(error.is_contract_violation());

        let error: OrchestratorError = CoreError::InvalidPlan("cycle".into()).into();
        assert!(!error.is_contract_violation());
    }

    #[test]
    fn test_conflict_list_display() {
        let error = OrchestratorError::UnresolvedGaps(vec![
            "OPS_TESTING".to_string(),
            "STACK_CACHE".to_string(),
        ]);
        assert_eq!(
            error.to_string(),
            "Unresolved research gaps: OPS_TESTING; STACK_CACHE"
        );
    }
}
