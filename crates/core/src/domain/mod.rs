mod catalog;
mod milestone;
mod plan;
mod research;
mod task;
mod technology;

pub use catalog::*;
pub use milestone::*;
pub use plan::*;
pub use research::*;
pub use task::*;
pub use technology::*;
