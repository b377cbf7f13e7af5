//! AI Orchestrator: task orchestration core.
//!
//! Moves tasks through qualification, scheduling and single-slot expensive
//! execution on top of a shared, CAS-updated task store.

pub mod activity;
pub mod api;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod resilience;
pub mod schedule;
pub mod store;
pub mod task;
pub mod testing;

pub use engine::{EngineDeps, EngineHandles, TaskOrchestrationEngine};
pub use error::{Error, Result};
