//! Persistence layer: task storage behind the `TaskStore` trait.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlTaskStore;
pub use memory::{InMemoryTaskStore, TransitionRecord};
pub use traits::{CandidateQuery, TaskQueue, TaskStore};
