use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Unknown research opportunity: {0}")]
    UnknownOpportunity(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
