//! The scheduling loop (§4.4): drives a run from its persisted state to a
//! terminal state, batch by batch, against the `Graph`'s ready-set. Grounded
//! on the teacher's `execution::workflow_engine` driver loop (load → batch →
//! await-all → reduce) generalized from LLM-pattern execution to a typed
//! DAG of heterogeneous step handlers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::db::{models::StepRun, NewStepRun, RunUpdate, Store, StepRunUpdate};
use crate::error::EngineError;
use crate::event::{EventBus, EventType};
use crate::graph::{Graph, WorkflowDefinition, WorkflowNode};
use crate::handler::{StepHandler, StepHandlerRegistry};
use crate::safe_eval::{safe_eval, truthy_value};
use crate::template::resolve_templates;
use crate::{EngineConfig, Result};

/// What a single node execution produced, for the batch reducer (§4.4.6).
enum NodeResult {
    Completed { node_id: String, output: Map<String, Value> },
    Paused { node_id: String, reason: String, waiting_for: &'static str },
    /// A retriable error exhausted its attempts; subject to `on_error`.
    Failed { node_id: String, error: String, on_error: String, attempt: i64 },
    /// Non-retriable: always fails the run regardless of `on_error`.
    Fatal { node_id: String, error: EngineError },
}

enum ReduceOutcome {
    Continue,
    Paused,
    Failed,
}

pub struct Engine {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    handlers: Arc<StepHandlerRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, handlers: Arc<StepHandlerRegistry>, config: EngineConfig) -> Self {
        Self { store, events, handlers, config }
    }

    /// Drives `run_id` forward until it reaches a terminal or paused state.
    /// A no-op if the run is already terminal (idempotence law, §8).
    pub async fn execute_run(&self, run_id: Uuid) -> Result<()> {
        let run_id_str = run_id.to_string();
        let run = self.store.get_run(&run_id_str).await?.ok_or_else(|| EngineError::RunNotFound(run_id_str.clone()))?;

        if crate::db::models::Run::is_terminal(&run) {
            return Ok(());
        }

        let workflow = self
            .store
            .get_workflow(&run.workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(run.workflow_id.clone()))?;
        let definition: WorkflowDefinition = serde_json::from_str(&workflow.definition)?;
        let graph = Arc::new(Graph::new(definition.nodes, definition.edges)?);

        let mut context: Map<String, Value> = serde_json::from_str(&run.context).unwrap_or_default();
        let input_value: Value = serde_json::from_str(&run.input).unwrap_or(Value::Null);
        context.insert("input".to_string(), input_value);

        let fresh_start = run.status == "pending";
        let now = now_str();
        if fresh_start {
            self.store
                .update_run(&run_id_str, RunUpdate { status: Some("running".into()), started_at: Some(Some(now.clone())), ..Default::default() })
                .await?;
            self.events.emit(run_id, EventType::RunStarted, None, json!({"status": "running"})).await;
        } else {
            self.store.update_run(&run_id_str, RunUpdate { status: Some("running".into()), ..Default::default() }).await?;
        }

        let started_at = if fresh_start {
            now
        } else {
            run.started_at.clone().unwrap_or(now)
        };
        let start_instant = std::time::Instant::now();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        loop {
            let current = self.store.get_run(&run_id_str).await?.ok_or_else(|| EngineError::RunNotFound(run_id_str.clone()))?;
            if current.status == "cancelled" {
                self.events.emit(run_id, EventType::RunCancelled, None, json!({"status": "cancelled"})).await;
                return Ok(());
            }

            if let Some(limit) = self.config.run_timeout_seconds {
                if start_instant.elapsed().as_secs_f64() > limit {
                    let duration_ms = start_instant.elapsed().as_millis() as u64;
                    self.store
                        .update_run(
                            &run_id_str,
                            RunUpdate {
                                status: Some("failed".into()),
                                error: Some(Some("run timed out".into())),
                                completed_at: Some(Some(now_str())),
                                context: Some(serde_json::to_string(&context)?),
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.events
                        .emit(run_id, EventType::RunFailed, None, json!({"status": "failed", "error": "run timed out", "duration_ms": duration_ms}))
                        .await;
                    return Ok(());
                }
            }

            let step_runs = self.store.list_step_runs(&run_id_str).await?;
            let done = compute_done(&step_runs);
            let ready = graph.ready_set(&done);
            if ready.is_empty() {
                break;
            }

            let results = self
                .run_batch(run_id, &run_id_str, &graph, ready.into_iter().cloned().collect(), context.clone(), Arc::clone(&semaphore))
                .await;

            match self.reduce_batch(run_id, &run_id_str, &mut context, results, start_instant).await? {
                ReduceOutcome::Continue => continue,
                ReduceOutcome::Paused | ReduceOutcome::Failed => return Ok(()),
            }
        }

        let duration_ms = start_instant.elapsed().as_millis() as u64;
        self.store
            .update_run(
                &run_id_str,
                RunUpdate {
                    status: Some("completed".into()),
                    error: Some(None),
                    completed_at: Some(Some(now_str())),
                    context: Some(serde_json::to_string(&context)?),
                    ..Default::default()
                },
            )
            .await?;
        self.events
            .emit(run_id, EventType::RunCompleted, None, json!({"status": "completed", "duration_ms": duration_ms}))
            .await;
        Ok(())
    }

    /// Resumes a paused run that was waiting on `step_id` (§4.4.7).
    pub async fn resume(&self, run_id: Uuid, step_id: &str, approval_data: Option<Value>) -> Result<()> {
        let run_id_str = run_id.to_string();
        let step_runs = self.store.list_step_runs(&run_id_str).await?;
        let waiting = step_runs
            .iter()
            .filter(|s| s.step_id == step_id && s.status == "waiting")
            .max_by_key(|s| s.attempt)
            .ok_or_else(|| EngineError::General(format!("no waiting step_run for step '{step_id}'")))?;

        self.store
            .update_step_run(
                &run_id_str,
                step_id,
                waiting.attempt,
                StepRunUpdate {
                    status: Some("completed".into()),
                    output: Some(Some(serde_json::to_string(&approval_data.unwrap_or(json!({})))?)),
                    completed_at: Some(Some(now_str())),
                    ..Default::default()
                },
            )
            .await?;

        self.store.update_run(&run_id_str, RunUpdate { status: Some("running".into()), ..Default::default() }).await?;
        self.events.emit(run_id, EventType::RunResumed, None, json!({"status": "running", "resumed_step_id": step_id})).await;

        self.execute_run(run_id).await
    }

    /// Resets every failed step_run to `pending` and re-drives the run
    /// (§4.4.8). Completed step outputs are untouched.
    pub async fn retry(&self, run_id: Uuid) -> Result<()> {
        let run_id_str = run_id.to_string();
        let step_runs = self.store.list_step_runs(&run_id_str).await?;
        for sr in step_runs.iter().filter(|s| s.status == "failed") {
            self.store
                .update_step_run(
                    &run_id_str,
                    &sr.step_id,
                    sr.attempt,
                    StepRunUpdate { status: Some("pending".into()), error: Some(None), completed_at: Some(None), ..Default::default() },
                )
                .await?;
        }
        self.store.update_run(&run_id_str, RunUpdate { status: Some("pending".into()), error: Some(None), ..Default::default() }).await?;
        self.execute_run(run_id).await
    }

    async fn run_batch(
        &self,
        run_id: Uuid,
        run_id_str: &str,
        graph: &Arc<Graph>,
        nodes: Vec<WorkflowNode>,
        context: Map<String, Value>,
        semaphore: Arc<Semaphore>,
    ) -> Vec<NodeResult> {
        let context = Arc::new(context);
        let mut handles = Vec::with_capacity(nodes.len());

        for node in nodes {
            let store = Arc::clone(&self.store);
            let events = Arc::clone(&self.events);
            let handlers = Arc::clone(&self.handlers);
            let graph = Arc::clone(graph);
            let context = Arc::clone(&context);
            let semaphore = Arc::clone(&semaphore);
            let run_id_str = run_id_str.to_string();
            let default_step_timeout = self.config.default_step_timeout_seconds;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                execute_node(&store, &events, &handlers, &graph, run_id, &run_id_str, &node, &context, default_step_timeout).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => results.push(NodeResult::Fatal {
                    node_id: "unknown".into(),
                    error: EngineError::General(format!("step task panicked: {join_err}")),
                }),
            }
        }
        results
    }

    async fn reduce_batch(
        &self,
        run_id: Uuid,
        run_id_str: &str,
        context: &mut Map<String, Value>,
        results: Vec<NodeResult>,
        start_instant: std::time::Instant,
    ) -> Result<ReduceOutcome> {
        for result in results {
            match result {
                NodeResult::Paused { node_id, reason, waiting_for } => {
                    self.store
                        .update_run(
                            run_id_str,
                            RunUpdate { status: Some("paused".into()), context: Some(serde_json::to_string(context)?), ..Default::default() },
                        )
                        .await?;
                    let duration_ms = start_instant.elapsed().as_millis() as u64;
                    self.events
                        .emit(
                            run_id,
                            EventType::RunPaused,
                            Some(node_id.clone()),
                            json!({"status": "paused", "waiting_step_id": node_id, "reason": reason, "duration_ms": duration_ms, "waiting_for": waiting_for}),
                        )
                        .await;
                    return Ok(ReduceOutcome::Paused);
                }
                NodeResult::Fatal { node_id, error } => {
                    self.fail_run(run_id, run_id_str, context, &node_id, &error.to_string(), start_instant).await?;
                    return Ok(ReduceOutcome::Failed);
                }
                NodeResult::Failed { node_id, error, on_error, attempt } => match on_error.as_str() {
                    "skip" => {
                        self.store
                            .update_step_run(run_id_str, &node_id, attempt, StepRunUpdate { status: Some("skipped".into()), completed_at: Some(Some(now_str())), ..Default::default() })
                            .await?;
                        self.events.emit(run_id, EventType::StepSkipped, Some(node_id.clone()), json!({"step_id": node_id, "status": "skipped", "reason": error})).await;
                    }
                    "continue" => {
                        self.store
                            .update_step_run(
                                run_id_str,
                                &node_id,
                                attempt,
                                StepRunUpdate { status: Some("skipped".into()), error: Some(Some(error.clone())), completed_at: Some(Some(now_str())), ..Default::default() },
                            )
                            .await?;
                        context.insert(node_id.clone(), json!({"_error": error}));
                        self.store
                            .update_run(run_id_str, RunUpdate { context: Some(serde_json::to_string(context)?), ..Default::default() })
                            .await?;
                        self.events
                            .emit(run_id, EventType::ContextUpdated, Some(node_id.clone()), json!({"step_id": node_id, "keys_added": [node_id]}))
                            .await;
                    }
                    _ => {
                        self.fail_run(run_id, run_id_str, context, &node_id, &error, start_instant).await?;
                        return Ok(ReduceOutcome::Failed);
                    }
                },
                NodeResult::Completed { node_id, output } => {
                    context.insert(node_id.clone(), Value::Object(output));
                    self.store
                        .update_run(run_id_str, RunUpdate { context: Some(serde_json::to_string(context)?), ..Default::default() })
                        .await?;
                    self.events
                        .emit(run_id, EventType::ContextUpdated, Some(node_id.clone()), json!({"step_id": node_id, "keys_added": [node_id]}))
                        .await;
                }
            }
        }
        Ok(ReduceOutcome::Continue)
    }

    async fn fail_run(&self, run_id: Uuid, run_id_str: &str, context: &Map<String, Value>, failed_step_id: &str, error: &str, start_instant: std::time::Instant) -> Result<()> {
        self.store
            .update_run(
                run_id_str,
                RunUpdate {
                    status: Some("failed".into()),
                    error: Some(Some(error.to_string())),
                    completed_at: Some(Some(now_str())),
                    context: Some(serde_json::to_string(context)?),
                    ..Default::default()
                },
            )
            .await?;
        let duration_ms = start_instant.elapsed().as_millis() as u64;
        self.events
            .emit(run_id, EventType::RunFailed, Some(failed_step_id.to_string()), json!({"status": "failed", "error": error, "failed_step_id": failed_step_id, "duration_ms": duration_ms}))
            .await;
        Ok(())
    }
}

/// Latest-attempt-per-step_id view of step_runs, used to compute readiness.
/// `on_error = continue` steps are persisted with status `skipped` (their
/// error preserved in the `error` column) specifically so they fold into
/// this set without a third "done but errored" status.
fn compute_done(step_runs: &[StepRun]) -> HashSet<String> {
    let mut latest: HashMap<&str, &StepRun> = HashMap::new();
    for sr in step_runs {
        latest
            .entry(sr.step_id.as_str())
            .and_modify(|existing| {
                if sr.attempt > existing.attempt {
                    *existing = sr;
                }
            })
            .or_insert(sr);
    }
    latest
        .values()
        .filter(|sr| sr.status == "completed" || sr.status == "skipped")
        .map(|sr| sr.step_id.clone())
        .collect()
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn backoff_delay(strategy: &str, base: f64, attempt: u32) -> Duration {
    let seconds = match strategy {
        "linear" => base * attempt as f64,
        "exponential" => base.powi(attempt as i32).min(300.0),
        _ => base,
    };
    Duration::from_secs_f64(seconds.max(0.0))
}

fn truncate_output(output: &Map<String, Value>) -> Value {
    if output.len() <= 5 {
        return json!(output);
    }
    let mut summary = Map::new();
    for (k, v) in output.iter().take(5) {
        summary.insert(k.clone(), v.clone());
    }
    summary.insert("_truncated".to_string(), Value::Bool(true));
    summary.insert("_total_keys".to_string(), json!(output.len()));
    Value::Object(summary)
}

/// Dispatches a single node by `step_type` (§4.4.2). Runs as a spawned task;
/// never panics on business failures — those become `NodeResult` variants.
async fn execute_node(
    store: &Arc<dyn Store>,
    events: &Arc<EventBus>,
    handlers: &Arc<StepHandlerRegistry>,
    graph: &Arc<Graph>,
    run_id: Uuid,
    run_id_str: &str,
    node: &WorkflowNode,
    context: &Map<String, Value>,
    default_step_timeout: Option<f64>,
) -> NodeResult {
    let context_value = Value::Object(context.clone());
    match node.node_type.as_str() {
        "condition" => execute_condition(store, events, graph, run_id, run_id_str, node, &context_value).await,
        "wait_for_approval" => execute_wait(store, events, run_id, run_id_str, node, "approval").await,
        "wait_for_event" => execute_wait(store, events, run_id, run_id_str, node, "event").await,
        "for_each" => execute_for_each(store, events, handlers, run_id, run_id_str, node, &context_value, default_step_timeout).await,
        other => {
            let Some(handler) = handlers.get(other) else {
                return NodeResult::Fatal { node_id: node.id.clone(), error: EngineError::UnknownStepType(other.to_string()) };
            };
            execute_generic(store, events, handler, run_id, run_id_str, node, &context_value, default_step_timeout).await
        }
    }
}

async fn execute_condition(
    store: &Arc<dyn Store>,
    events: &Arc<EventBus>,
    graph: &Arc<Graph>,
    run_id: Uuid,
    run_id_str: &str,
    node: &WorkflowNode,
    context: &Value,
) -> NodeResult {
    let expression = node.data.config.get("expression").and_then(Value::as_str).unwrap_or("false");
    let resolved = match resolve_templates(&Value::String(expression.to_string()), context) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(e) => return NodeResult::Fatal { node_id: node.id.clone(), error: e },
    };

    if let Err(e) = store
        .create_step_run(NewStepRun {
            run_id: run_id_str.to_string(),
            step_id: node.id.clone(),
            step_type: "condition".into(),
            attempt: 1,
            status: "running".into(),
            input: json!({"expression": resolved}).to_string(),
        })
        .await
    {
        return NodeResult::Fatal { node_id: node.id.clone(), error: e };
    }
    events.emit(run_id, EventType::StepStarted, Some(node.id.clone()), json!({"step_id": node.id, "step_type": "condition", "step_label": node.data.label, "attempt": 1})).await;

    let result = match safe_eval(&resolved, context) {
        Ok(v) => truthy_value(&v),
        Err(e) => return NodeResult::Fatal { node_id: node.id.clone(), error: e },
    };

    let output = json!({"result": result, "branch": if result { "true" } else { "false" }});
    if let Err(e) = store
        .update_step_run(run_id_str, &node.id, 1, StepRunUpdate { status: Some("completed".into()), output: Some(Some(output.to_string())), completed_at: Some(Some(now_str())), ..Default::default() })
        .await
    {
        return NodeResult::Fatal { node_id: node.id.clone(), error: e };
    }
    events
        .emit(run_id, EventType::StepCompleted, Some(node.id.clone()), json!({"step_id": node.id, "step_type": "condition", "status": "completed", "output_summary": output, "duration_ms": 0}))
        .await;

    let losing_label = if result { "false" } else { "true" };
    let skip = graph.exclusive_branch_nodes(&node.id, losing_label);
    for skipped_id in skip {
        if store
            .create_step_run(NewStepRun {
                run_id: run_id_str.to_string(),
                step_id: skipped_id.clone(),
                step_type: "skipped".into(),
                attempt: 1,
                status: "skipped".into(),
                input: "{}".into(),
            })
            .await
            .is_ok()
        {
            events
                .emit(run_id, EventType::StepSkipped, Some(skipped_id.clone()), json!({"step_id": skipped_id, "status": "skipped", "reason": format!("excluded by condition '{}'", node.id)}))
                .await;
        }
    }

    let mut final_map = Map::new();
    final_map.insert("result".to_string(), Value::Bool(result));
    final_map.insert("branch".to_string(), Value::String(if result { "true".into() } else { "false".into() }));
    NodeResult::Completed { node_id: node.id.clone(), output: final_map }
}

async fn execute_wait(store: &Arc<dyn Store>, events: &Arc<EventBus>, run_id: Uuid, run_id_str: &str, node: &WorkflowNode, kind: &'static str) -> NodeResult {
    if let Err(e) = store
        .create_step_run(NewStepRun {
            run_id: run_id_str.to_string(),
            step_id: node.id.clone(),
            step_type: node.node_type.clone(),
            attempt: 1,
            status: "waiting".into(),
            input: node.data.config.to_string(),
        })
        .await
    {
        return NodeResult::Fatal { node_id: node.id.clone(), error: e };
    }
    events
        .emit(
            run_id,
            EventType::StepWaiting,
            Some(node.id.clone()),
            json!({"step_id": node.id, "step_type": node.node_type, "status": "waiting", "waiting_for": kind, "label": node.data.label}),
        )
        .await;
    NodeResult::Paused { node_id: node.id.clone(), reason: format!("waiting for {kind}"), waiting_for: kind }
}

async fn execute_for_each(
    store: &Arc<dyn Store>,
    events: &Arc<EventBus>,
    handlers: &Arc<StepHandlerRegistry>,
    run_id: Uuid,
    run_id_str: &str,
    node: &WorkflowNode,
    context: &Value,
    default_step_timeout: Option<f64>,
) -> NodeResult {
    let resolved_config = match resolve_templates(&node.data.config, context) {
        Ok(v) => v,
        Err(e) => return NodeResult::Fatal { node_id: node.id.clone(), error: e },
    };

    let items = match resolved_config.get("items").and_then(Value::as_array) {
        Some(items) => items.clone(),
        None => return NodeResult::Fatal { node_id: node.id.clone(), error: EngineError::General(format!("for_each node '{}' resolved items is not a list", node.id)) },
    };

    if let Err(e) = store
        .create_step_run(NewStepRun { run_id: run_id_str.to_string(), step_id: node.id.clone(), step_type: "for_each".into(), attempt: 1, status: "running".into(), input: resolved_config.to_string() })
        .await
    {
        return NodeResult::Fatal { node_id: node.id.clone(), error: e };
    }
    events.emit(run_id, EventType::StepStarted, Some(node.id.clone()), json!({"step_id": node.id, "step_type": "for_each", "step_label": node.data.label, "attempt": 1})).await;

    let sub_type = resolved_config.get("handler").and_then(Value::as_str).unwrap_or(node.node_type.as_str());
    let item_config = resolved_config.get("item_config").cloned();

    let mut results = Vec::with_capacity(items.len());
    if let (Some(handler), Some(item_config)) = (handlers.get(sub_type), item_config) {
        for (index, item) in items.iter().enumerate() {
            let mut iter_context = context.as_object().cloned().unwrap_or_default();
            iter_context.insert("_item".to_string(), item.clone());
            iter_context.insert("_index".to_string(), json!(index));
            let iter_context_value = Value::Object(iter_context);

            let per_item_config = match resolve_templates(&item_config, &iter_context_value) {
                Ok(v) => v,
                Err(e) => {
                    results.push(json!({"_error": e.to_string(), "_index": index}));
                    continue;
                }
            };

            match run_with_timeout(handler.execute(&per_item_config, &iter_context_value), default_step_timeout).await {
                Ok(Ok(map)) => results.push(Value::Object(map)),
                Ok(Err(e)) => results.push(json!({"_error": e.to_string(), "_index": index})),
                Err(_) => results.push(json!({"_error": "timed out", "_index": index})),
            }
        }
    } else {
        results = items.clone();
    }

    let output = json!({"items": items, "count": results.len(), "results": results});
    if let Err(e) = store
        .update_step_run(run_id_str, &node.id, 1, StepRunUpdate { status: Some("completed".into()), output: Some(Some(output.to_string())), completed_at: Some(Some(now_str())), ..Default::default() })
        .await
    {
        return NodeResult::Fatal { node_id: node.id.clone(), error: e };
    }
    events
        .emit(run_id, EventType::StepCompleted, Some(node.id.clone()), json!({"step_id": node.id, "step_type": "for_each", "status": "completed", "output_summary": truncate_output(output.as_object().unwrap()), "duration_ms": 0}))
        .await;

    let Value::Object(output_map) = output else { unreachable!() };
    NodeResult::Completed { node_id: node.id.clone(), output: output_map }
}

async fn run_with_timeout<F, T>(fut: F, timeout_seconds: Option<f64>) -> std::result::Result<T, ()>
where
    F: std::future::Future<Output = T>,
{
    match timeout_seconds {
        Some(seconds) => tokio::time::timeout(Duration::from_secs_f64(seconds.max(0.0)), fut).await.map_err(|_| ()),
        None => Ok(fut.await),
    }
}

async fn execute_generic(
    store: &Arc<dyn Store>,
    events: &Arc<EventBus>,
    handler: &dyn StepHandler,
    run_id: Uuid,
    run_id_str: &str,
    node: &WorkflowNode,
    context: &Value,
    default_step_timeout: Option<f64>,
) -> NodeResult {
    let max_attempts = node.data.max_attempts.unwrap_or(1).max(1);
    let backoff_strategy = node.data.backoff_strategy.as_deref().unwrap_or("fixed");
    let backoff_base = node.data.backoff_base.unwrap_or(2.0);
    let timeout_seconds = node.data.timeout_seconds.or(default_step_timeout);
    let on_error = node.data.on_error.clone().unwrap_or_else(|| "fail".to_string());

    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let resolved_config = match resolve_templates(&node.data.config, context) {
            Ok(v) => v,
            Err(e) => return NodeResult::Fatal { node_id: node.id.clone(), error: e },
        };

        if let Err(e) = store
            .create_step_run(NewStepRun {
                run_id: run_id_str.to_string(),
                step_id: node.id.clone(),
                step_type: node.node_type.clone(),
                attempt: attempt as i64,
                status: "running".into(),
                input: resolved_config.to_string(),
            })
            .await
        {
            return NodeResult::Fatal { node_id: node.id.clone(), error: e };
        }
        events
            .emit(run_id, EventType::StepStarted, Some(node.id.clone()), json!({"step_id": node.id, "step_type": node.node_type, "step_label": node.data.label, "attempt": attempt}))
            .await;

        let started = std::time::Instant::now();
        let outcome = run_with_timeout(handler.execute(&resolved_config, context), timeout_seconds).await;

        match outcome {
            Ok(Ok(output)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let output_value = Value::Object(output.clone());
                if let Err(e) = store
                    .update_step_run(run_id_str, &node.id, attempt as i64, StepRunUpdate { status: Some("completed".into()), output: Some(Some(output_value.to_string())), completed_at: Some(Some(now_str())), ..Default::default() })
                    .await
                {
                    return NodeResult::Fatal { node_id: node.id.clone(), error: e };
                }
                events
                    .emit(
                        run_id,
                        EventType::StepCompleted,
                        Some(node.id.clone()),
                        json!({"step_id": node.id, "step_type": node.node_type, "status": "completed", "output_summary": truncate_output(&output), "duration_ms": duration_ms}),
                    )
                    .await;
                return NodeResult::Completed { node_id: node.id.clone(), output };
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
            }
            Err(()) => {
                last_error = format!("step timed out after {}s", timeout_seconds.unwrap_or(0.0));
            }
        }

        let _ = store
            .update_step_run(run_id_str, &node.id, attempt as i64, StepRunUpdate { status: Some("failed".into()), error: Some(Some(last_error.clone())), completed_at: Some(Some(now_str())), ..Default::default() })
            .await;

        if attempt < max_attempts {
            let delay = backoff_delay(backoff_strategy, backoff_base, attempt);
            events
                .emit(
                    run_id,
                    EventType::StepRetrying,
                    Some(node.id.clone()),
                    json!({"step_id": node.id, "attempt": attempt, "max_attempts": max_attempts, "backoff_seconds": delay.as_secs_f64(), "error": last_error}),
                )
                .await;
            tokio::time::sleep(delay).await;
        }
    }

    events
        .emit(run_id, EventType::StepFailed, Some(node.id.clone()), json!({"step_id": node.id, "step_type": node.node_type, "status": "failed", "error": last_error, "attempt": max_attempts}))
        .await;
    NodeResult::Failed { node_id: node.id.clone(), error: last_error, on_error, attempt: max_attempts as i64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewRun, NewWorkflow, SqliteStore};
    use crate::handler::StepHandlerRegistry;
    use sqlx::sqlite::SqlitePool;

    async fn build_engine() -> (Engine, Arc<dyn Store>) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let events = Arc::new(EventBus::new(Arc::clone(&store), 256));
        let handlers = Arc::new(StepHandlerRegistry::with_builtins());
        let config = EngineConfig { max_concurrency: 10, ..Default::default() };
        (Engine::new(Arc::clone(&store), events, handlers, config), store)
    }

    fn def(nodes: Value, edges: Value) -> String {
        json!({"nodes": nodes, "edges": edges}).to_string()
    }

    #[tokio::test]
    async fn linear_three_step_completes() {
        let (engine, store) = build_engine().await;
        let definition = def(
            json!([
                {"id": "a", "type": "transform", "data": {"config": {"data": {"x": 1}}}},
                {"id": "b", "type": "transform", "data": {"config": {"data": {"y": 2}}}},
                {"id": "c", "type": "transform", "data": {"config": {"data": {"z": 3}}}},
            ]),
            json!([{"source": "a", "target": "b"}, {"source": "b", "target": "c"}]),
        );
        let wf = store.create_workflow(NewWorkflow { name: "linear".into(), definition, input_schema: None }).await.unwrap();
        let run = store.create_run(NewRun { workflow_id: wf.id, trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None }).await.unwrap();
        let run_id = Uuid::parse_str(&run.id).unwrap();

        engine.execute_run(run_id).await.unwrap();

        let finished = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, "completed");
        let steps = store.list_step_runs(&run.id).await.unwrap();
        assert!(steps.iter().all(|s| s.status == "completed"));
    }

    #[tokio::test]
    async fn condition_true_branch_skips_false_side() {
        let (engine, store) = build_engine().await;
        let definition = def(
            json!([
                {"id": "cond", "type": "condition", "data": {"config": {"expression": "true"}}},
                {"id": "yes", "type": "transform", "data": {"config": {"data": {"taken": "yes"}}}},
                {"id": "no", "type": "transform", "data": {"config": {"data": {"taken": "no"}}}},
            ]),
            json!([
                {"source": "cond", "target": "yes", "sourceHandle": "true"},
                {"source": "cond", "target": "no", "sourceHandle": "false"},
            ]),
        );
        let wf = store.create_workflow(NewWorkflow { name: "cond".into(), definition, input_schema: None }).await.unwrap();
        let run = store.create_run(NewRun { workflow_id: wf.id, trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None }).await.unwrap();
        let run_id = Uuid::parse_str(&run.id).unwrap();

        engine.execute_run(run_id).await.unwrap();

        let steps = store.list_step_runs(&run.id).await.unwrap();
        let yes = steps.iter().find(|s| s.step_id == "yes").unwrap();
        let no = steps.iter().find(|s| s.step_id == "no").unwrap();
        assert_eq!(yes.status, "completed");
        assert_eq!(no.status, "skipped");
    }

    #[tokio::test]
    async fn approval_pause_then_resume_completes() {
        let (engine, store) = build_engine().await;
        let definition = def(
            json!([
                {"id": "a", "type": "transform", "data": {"config": {"data": {"x": 1}}}},
                {"id": "approval", "type": "wait_for_approval", "data": {"config": {}}},
                {"id": "b", "type": "transform", "data": {"config": {"data": {"y": 2}}}},
            ]),
            json!([{"source": "a", "target": "approval"}, {"source": "approval", "target": "b"}]),
        );
        let wf = store.create_workflow(NewWorkflow { name: "approve".into(), definition, input_schema: None }).await.unwrap();
        let run = store.create_run(NewRun { workflow_id: wf.id, trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None }).await.unwrap();
        let run_id = Uuid::parse_str(&run.id).unwrap();

        engine.execute_run(run_id).await.unwrap();
        let paused = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(paused.status, "paused");

        engine.resume(run_id, "approval", Some(json!({"approved": true}))).await.unwrap();
        let finished = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, "completed");
    }

    /// Fails its first `remaining_failures` calls, then always succeeds.
    /// Used to exercise the retry/backoff loop in `execute_generic` without
    /// depending on a built-in handler that never fails on its own.
    struct FlakyHandler {
        remaining_failures: std::sync::atomic::AtomicUsize,
    }

    impl FlakyHandler {
        fn new(failures: usize) -> Self {
            Self { remaining_failures: std::sync::atomic::AtomicUsize::new(failures) }
        }
    }

    #[async_trait::async_trait]
    impl StepHandler for FlakyHandler {
        async fn execute(&self, _config: &Value, _context: &Value) -> Result<Map<String, Value>> {
            use std::sync::atomic::Ordering;
            let had_failure_left = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None })
                .is_ok();
            if had_failure_left {
                return Err(EngineError::General("flaky handler failing on purpose".into()));
            }
            let mut map = Map::new();
            map.insert("ok".to_string(), Value::Bool(true));
            Ok(map)
        }

        fn metadata(&self) -> crate::handler::HandlerMetadata {
            crate::handler::HandlerMetadata { label: "Flaky".into(), description: "Fails a fixed number of times then succeeds".into() }
        }
    }

    #[tokio::test]
    async fn retry_then_succeed_records_all_attempts_and_events() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let events = Arc::new(EventBus::new(Arc::clone(&store), 256));
        let mut registry = StepHandlerRegistry::with_builtins();
        registry.register("flaky", Box::new(FlakyHandler::new(2)));
        let handlers = Arc::new(registry);
        let config = EngineConfig { max_concurrency: 10, ..Default::default() };
        let engine = Engine::new(Arc::clone(&store), events, handlers, config);

        let definition = def(
            json!([
                {"id": "a", "type": "flaky", "data": {"config": {}, "max_attempts": 3, "backoff_strategy": "fixed", "backoff_base": 0.01}},
            ]),
            json!([]),
        );
        let wf = store.create_workflow(NewWorkflow { name: "flaky-wf".into(), definition, input_schema: None }).await.unwrap();
        let run = store.create_run(NewRun { workflow_id: wf.id, trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None }).await.unwrap();
        let run_id = Uuid::parse_str(&run.id).unwrap();

        engine.execute_run(run_id).await.unwrap();

        let finished = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, "completed");
        assert!(finished.error.is_none());

        let mut steps = store.list_step_runs(&run.id).await.unwrap();
        assert_eq!(steps.len(), 3);
        steps.sort_by_key(|s| s.attempt);
        assert_eq!(steps[0].status, "failed");
        assert_eq!(steps[1].status, "failed");
        assert_eq!(steps[2].status, "completed");

        let run_events = store.list_run_events(&run.id).await.unwrap();
        let retrying = run_events.iter().filter(|e| e.event_type == EventType::StepRetrying.as_str()).count();
        let completed = run_events.iter().filter(|e| e.event_type == EventType::StepCompleted.as_str()).count();
        assert_eq!(retrying, 2);
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn cancel_mid_run_stops_before_next_batch() {
        let (engine, store) = build_engine().await;
        let definition = def(
            json!([
                {"id": "a", "type": "delay", "data": {"config": {"seconds": 0.05}}},
                {"id": "b", "type": "transform", "data": {"config": {"data": {"y": 2}}}},
            ]),
            json!([{"source": "a", "target": "b"}]),
        );
        let wf = store.create_workflow(NewWorkflow { name: "cancel".into(), definition, input_schema: None }).await.unwrap();
        let run = store.create_run(NewRun { workflow_id: wf.id, trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None }).await.unwrap();
        let run_id = Uuid::parse_str(&run.id).unwrap();

        let run_id_for_cancel = run.id.clone();
        let store_for_cancel = Arc::clone(&store);
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store_for_cancel.update_run(&run_id_for_cancel, RunUpdate { status: Some("cancelled".into()), ..Default::default() }).await.unwrap();
        });

        engine.execute_run(run_id).await.unwrap();
        canceller.await.unwrap();

        let finished = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, "cancelled");

        let steps = store.list_step_runs(&run.id).await.unwrap();
        assert!(steps.iter().any(|s| s.step_id == "a" && s.status == "completed"), "in-flight batch is allowed to finish");
        assert!(steps.iter().all(|s| s.step_id != "b"), "no new batch should start once cancelled");
    }

    #[tokio::test]
    async fn resuming_terminal_run_is_noop() {
        let (engine, store) = build_engine().await;
        let definition = def(json!([{"id": "a", "type": "transform", "data": {"config": {"data": {}}}}]), json!([]));
        let wf = store.create_workflow(NewWorkflow { name: "noop".into(), definition, input_schema: None }).await.unwrap();
        let run = store.create_run(NewRun { workflow_id: wf.id, trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None }).await.unwrap();
        let run_id = Uuid::parse_str(&run.id).unwrap();

        engine.execute_run(run_id).await.unwrap();
        let events_before = store.list_run_events(&run.id).await.unwrap().len();

        engine.execute_run(run_id).await.unwrap();
        let events_after = store.list_run_events(&run.id).await.unwrap().len();
        assert_eq!(events_before, events_after);
    }

    #[test]
    fn backoff_strategies_match_formula() {
        assert_eq!(backoff_delay("fixed", 2.0, 3).as_secs_f64(), 2.0);
        assert_eq!(backoff_delay("linear", 2.0, 3).as_secs_f64(), 6.0);
        assert_eq!(backoff_delay("exponential", 2.0, 3).as_secs_f64(), 8.0);
        assert_eq!(backoff_delay("exponential", 10.0, 5).as_secs_f64(), 300.0);
    }
}
