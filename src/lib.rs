//! Durable DAG workflow execution: graph analysis, typed template
//! interpolation, sandboxed condition evaluation, validation, persistence,
//! an event bus, a step-handler registry, and the scheduling engine that
//! ties them together.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod handler;
pub mod safe_eval;
pub mod template;
pub mod validator;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};

/// Installs a `tracing` subscriber reading `RUST_LOG` (defaulting to
/// `info`), mirroring the teacher's process entry point.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
