//! Step handler interface (§4.7) and the illustrative handlers carried
//! forward from the original implementation (§4.7.1). Grounded on the
//! teacher's `TaskExecutor` trait (async-trait, `Send + Sync`) generalized
//! from one task type to a registry keyed by step type.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::EngineError;
use crate::template::resolve_templates;
use crate::Result;

/// Describes a handler for display in editors/docs; purely informational.
#[derive(Debug, Clone)]
pub struct HandlerMetadata {
    pub label: String,
    pub description: String,
}

/// A re-entrant unit of work dispatched by step type. Handlers receive a
/// fully resolved `config` (templates already applied against `context`)
/// and a read-only `context`; they never touch the store directly (§4.7).
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, config: &Value, context: &Value) -> Result<Map<String, Value>>;

    fn metadata(&self) -> HandlerMetadata;
}

/// Maps step type names to their handler. `condition`, `wait_for_approval`,
/// `wait_for_event`, and `for_each` are dispatched by the engine itself and
/// are never registered here (validator's `ENGINE_HANDLED_TYPES`).
#[derive(Default)]
pub struct StepHandlerRegistry {
    handlers: HashMap<String, Box<dyn StepHandler>>,
}

impl StepHandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, step_type: impl Into<String>, handler: Box<dyn StepHandler>) {
        self.handlers.insert(step_type.into(), handler);
    }

    pub fn get(&self, step_type: &str) -> Option<&dyn StepHandler> {
        self.handlers.get(step_type).map(|h| h.as_ref())
    }

    pub fn registered_types(&self) -> std::collections::HashSet<String> {
        self.handlers.keys().cloned().collect()
    }

    /// A registry preloaded with the illustrative handlers, handy for
    /// examples and scenario tests.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("transform", Box::new(TransformHandler));
        registry.register("delay", Box::new(DelayHandler));
        registry
    }
}

/// Resolves every template in `config.data` (or `config` itself when no
/// `data` key is present) against `context` and returns the result
/// verbatim. The simplest possible handler; used pervasively in the
/// engine's own scenario tests.
pub struct TransformHandler;

#[async_trait]
impl StepHandler for TransformHandler {
    async fn execute(&self, config: &Value, context: &Value) -> Result<Map<String, Value>> {
        let source = config.get("data").unwrap_or(config);
        let resolved = resolve_templates(source, context)?;
        match resolved {
            Value::Object(map) => Ok(map),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Ok(map)
            }
        }
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            label: "Transform".to_string(),
            description: "Resolves templates against the run context and returns the result".to_string(),
        }
    }
}

/// Sleeps `config.seconds` (clamped to `[0, 60]`, default 0) and returns
/// `{slept_seconds}`. Used to exercise cancellation-mid-run behavior,
/// since it's the only illustrative handler with an observable await point.
pub struct DelayHandler;

#[async_trait]
impl StepHandler for DelayHandler {
    async fn execute(&self, config: &Value, _context: &Value) -> Result<Map<String, Value>> {
        let requested = config.get("seconds").and_then(Value::as_f64).unwrap_or(0.0);
        let clamped = requested.clamp(0.0, 60.0);
        tokio::time::sleep(Duration::from_secs_f64(clamped)).await;

        let mut map = Map::new();
        map.insert("slept_seconds".to_string(), Value::from(clamped));
        Ok(map)
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            label: "Delay".to_string(),
            description: "Sleeps for a fixed duration, returning the elapsed seconds".to_string(),
        }
    }
}

pub fn unknown_step_type(step_type: &str) -> EngineError {
    EngineError::UnknownStepType(step_type.to_string())
}
