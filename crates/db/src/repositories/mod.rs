mod milestone_repository;
mod process_state_repository;
mod research_repository;
mod task_repository;
mod technology_repository;

pub use milestone_repository::*;
pub use process_state_repository::*;
pub use research_repository::*;
pub use task_repository::*;
pub use technology_repository::*;
