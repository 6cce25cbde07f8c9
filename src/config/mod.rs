//! Engine configuration: YAML loading with `$include`/`${ENV:-default}`
//! expansion (teacher's `config::loader`), plus the typed `EngineConfig`
//! the engine, event bus, and store builder are constructed from.

pub mod loader;

pub use loader::{deep_merge, load_yaml_config, load_yaml_file};

use serde::{Deserialize, Serialize};

fn default_max_concurrency() -> usize {
    10
}

fn default_subscriber_queue_capacity() -> usize {
    256
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

/// Top-level engine configuration (§1.1). Loaded via [`load_yaml_config`]
/// or constructed directly for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub run_timeout_seconds: Option<f64>,

    #[serde(default)]
    pub default_step_timeout_seconds: Option<f64>,

    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            run_timeout_seconds: None,
            default_step_timeout_seconds: None,
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            database_url: default_database_url(),
        }
    }
}
