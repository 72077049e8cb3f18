use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A persisted value is outside its closed enumeration or unparsable.
    #[error("Store corruption in {table}.{column}: unexpected value '{value}'")]
    Corrupt {
        table: &'static str,
        column: &'static str,
        value: String,
    },

    #[error("Milestone not found: {0}")]
    MilestoneNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Research opportunity not found: {0}")]
    OpportunityNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub(crate) fn corrupt(table: &'static str, column: &'static str, value: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            column,
            value: value.into(),
        }
    }
}
