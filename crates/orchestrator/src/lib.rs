pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod progress;
pub mod prompts;
pub mod research;
pub mod scheduler;
pub mod services;
pub mod state_machine;

pub use config::{OrchestratorConfig, ResearchConfig, SchedulerConfig, Severity, VerificationMode};
pub use driver::{Driver, DriverOutcome, Planner};
pub use error::{OrchestratorError, Result};
pub use executor::{TaskAssignment, TaskExecutor, TaskOutcome};
pub use progress::{ProgressReport, ProgressReporter};
pub use research::{
    FoundationSelection, ResearchOrchestrator, ResearchOutcome, ResearchRecovery, ResearchRequest,
    ResearchWorker,
};
pub use scheduler::{BlockedReason, NextAction, Scheduler, SchedulerRecovery};
pub use services::{HttpSourceVerifier, SourceVerifier, Verification};
pub use state_machine::{OpportunityStateMachine, TaskStateMachine};
