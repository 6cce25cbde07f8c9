//! Persistence layer: row models and the `Store` trait the engine runs
//! against.

pub mod models;
pub mod store;

pub use store::{NewRun, NewRunEvent, NewStepRun, NewWorkflow, RunUpdate, SqliteStore, Store, StepRunUpdate};
