//! Persistence contract (§4.6). The engine talks to storage exclusively
//! through the `Store` trait so tests can substitute an in-memory sqlite
//! pool without touching engine code, and so a non-sqlx backend could be
//! substituted later. Grounded on the teacher's per-entity repository
//! functions (`db::repositories::workflow_repo`, free functions taking
//! `&DatabasePool`) but gathered behind one trait object per SPEC_FULL.md
//! §9 "construction-time injection" design note.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use super::models::{Run, RunEvent, StepRun, Workflow};
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct NewWorkflow {
    pub name: String,
    pub definition: String,
    pub input_schema: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub workflow_id: String,
    pub trigger_type: String,
    pub input: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<String>,
    pub context: Option<String>,
    pub error: Option<Option<String>>,
    pub started_at: Option<Option<String>>,
    pub completed_at: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewStepRun {
    pub run_id: String,
    pub step_id: String,
    pub step_type: String,
    pub attempt: i64,
    pub status: String,
    pub input: String,
}

#[derive(Debug, Clone, Default)]
pub struct StepRunUpdate {
    pub status: Option<String>,
    pub output: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub started_at: Option<Option<String>>,
    pub completed_at: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewRunEvent {
    pub run_id: String,
    pub step_id: Option<String>,
    pub event_type: String,
    pub payload: String,
}

/// The engine's persistence contract. Implementations must give per-row
/// atomic writes; the engine never spans a transaction across calls.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;
    async fn create_workflow(&self, fields: NewWorkflow) -> Result<Workflow>;
    async fn update_workflow_status(&self, id: &str, status: &str) -> Result<()>;
    async fn delete_workflow(&self, id: &str) -> Result<()>;
    async fn list_workflows(&self) -> Result<Vec<Workflow>>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>>;
    async fn create_run(&self, fields: NewRun) -> Result<Run>;
    async fn update_run(&self, id: &str, fields: RunUpdate) -> Result<()>;

    async fn list_step_runs(&self, run_id: &str) -> Result<Vec<StepRun>>;
    async fn create_step_run(&self, fields: NewStepRun) -> Result<StepRun>;
    /// Updates the single step_run row matching `(run_id, step_id, attempt)` —
    /// the latest attempt, by construction, since the engine only ever has
    /// one attempt in flight per step at a time (§5 "Ordering").
    async fn update_step_run(&self, run_id: &str, step_id: &str, attempt: i64, fields: StepRunUpdate) -> Result<()>;

    async fn create_run_event(&self, fields: NewRunEvent) -> Result<RunEvent>;
    async fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn create_workflow(&self, fields: NewWorkflow) -> Result<Workflow> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = super::models::now_rfc3339();
        sqlx::query(
            "INSERT INTO workflows (id, name, version, status, definition, input_schema, created_at, updated_at)
             VALUES (?, ?, 1, 'draft', ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&fields.name)
        .bind(&fields.definition)
        .bind(&fields.input_schema)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_workflow(&id).await?.ok_or(crate::EngineError::WorkflowNotFound(id))
    }

    async fn update_workflow_status(&self, id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(super::models::now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_workflow(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workflows WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn create_run(&self, fields: NewRun) -> Result<Run> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = super::models::now_rfc3339();
        sqlx::query(
            "INSERT INTO runs (id, workflow_id, status, trigger_type, input, context, idempotency_key, created_at, updated_at)
             VALUES (?, ?, 'pending', ?, ?, '{}', ?, ?, ?)",
        )
        .bind(&id)
        .bind(&fields.workflow_id)
        .bind(&fields.trigger_type)
        .bind(&fields.input)
        .bind(&fields.idempotency_key)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_run(&id).await?.ok_or(crate::EngineError::RunNotFound(id))
    }

    async fn update_run(&self, id: &str, fields: RunUpdate) -> Result<()> {
        let mut sets = Vec::new();
        if fields.status.is_some() {
            sets.push("status = ?");
        }
        if fields.context.is_some() {
            sets.push("context = ?");
        }
        if fields.error.is_some() {
            sets.push("error = ?");
        }
        if fields.started_at.is_some() {
            sets.push("started_at = ?");
        }
        if fields.completed_at.is_some() {
            sets.push("completed_at = ?");
        }
        if sets.is_empty() {
            return Ok(());
        }
        sets.push("updated_at = ?");

        let sql = format!("UPDATE runs SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        if let Some(v) = &fields.status {
            query = query.bind(v);
        }
        if let Some(v) = &fields.context {
            query = query.bind(v);
        }
        if let Some(v) = &fields.error {
            query = query.bind(v);
        }
        if let Some(v) = &fields.started_at {
            query = query.bind(v);
        }
        if let Some(v) = &fields.completed_at {
            query = query.bind(v);
        }
        query = query.bind(super::models::now_rfc3339()).bind(id);
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn list_step_runs(&self, run_id: &str) -> Result<Vec<StepRun>> {
        let rows = sqlx::query_as::<_, StepRun>("SELECT * FROM step_runs WHERE run_id = ? ORDER BY created_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn create_step_run(&self, fields: NewStepRun) -> Result<StepRun> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = super::models::now_rfc3339();
        sqlx::query(
            "INSERT INTO step_runs (id, run_id, step_id, step_type, attempt, status, input, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&fields.run_id)
        .bind(&fields.step_id)
        .bind(&fields.step_type)
        .bind(fields.attempt)
        .bind(&fields.status)
        .bind(&fields.input)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, StepRun>("SELECT * FROM step_runs WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn update_step_run(&self, run_id: &str, step_id: &str, attempt: i64, fields: StepRunUpdate) -> Result<()> {
        let mut sets = Vec::new();
        if fields.status.is_some() {
            sets.push("status = ?");
        }
        if fields.output.is_some() {
            sets.push("output = ?");
        }
        if fields.error.is_some() {
            sets.push("error = ?");
        }
        if fields.started_at.is_some() {
            sets.push("started_at = ?");
        }
        if fields.completed_at.is_some() {
            sets.push("completed_at = ?");
        }
        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!("UPDATE step_runs SET {} WHERE run_id = ? AND step_id = ? AND attempt = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        if let Some(v) = &fields.status {
            query = query.bind(v);
        }
        if let Some(v) = &fields.output {
            query = query.bind(v);
        }
        if let Some(v) = &fields.error {
            query = query.bind(v);
        }
        if let Some(v) = &fields.started_at {
            query = query.bind(v);
        }
        if let Some(v) = &fields.completed_at {
            query = query.bind(v);
        }
        query = query.bind(run_id).bind(step_id).bind(attempt);
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn create_run_event(&self, fields: NewRunEvent) -> Result<RunEvent> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = super::models::now_rfc3339();
        sqlx::query(
            "INSERT INTO run_events (id, run_id, step_id, event_type, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&fields.run_id)
        .bind(&fields.step_id)
        .bind(&fields.event_type)
        .bind(&fields.payload)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, RunEvent>("SELECT * FROM run_events WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let rows = sqlx::query_as::<_, RunEvent>("SELECT * FROM run_events WHERE run_id = ? ORDER BY created_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SqliteStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn create_and_get_workflow() {
        let store = setup().await;
        let wf = store
            .create_workflow(NewWorkflow { name: "demo".into(), definition: "{}".into(), input_schema: None })
            .await
            .unwrap();
        assert_eq!(wf.name, "demo");
        assert!(wf.is_draft());

        let fetched = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, wf.id);
    }

    #[tokio::test]
    async fn create_run_and_update_status() {
        let store = setup().await;
        let wf = store
            .create_workflow(NewWorkflow { name: "demo".into(), definition: "{}".into(), input_schema: None })
            .await
            .unwrap();
        let run = store
            .create_run(NewRun { workflow_id: wf.id.clone(), trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None })
            .await
            .unwrap();
        assert_eq!(run.status, "pending");

        store
            .update_run(&run.id, RunUpdate { status: Some("running".into()), started_at: Some(Some(super::super::models::now_rfc3339())), ..Default::default() })
            .await
            .unwrap();

        let updated = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(updated.status, "running");
        assert!(updated.started_at.is_some());
    }

    #[tokio::test]
    async fn step_run_uniqueness_per_attempt() {
        let store = setup().await;
        let wf = store
            .create_workflow(NewWorkflow { name: "demo".into(), definition: "{}".into(), input_schema: None })
            .await
            .unwrap();
        let run = store
            .create_run(NewRun { workflow_id: wf.id, trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None })
            .await
            .unwrap();

        store
            .create_step_run(NewStepRun {
                run_id: run.id.clone(),
                step_id: "a".into(),
                step_type: "transform".into(),
                attempt: 1,
                status: "running".into(),
                input: "{}".into(),
            })
            .await
            .unwrap();

        store
            .update_step_run(&run.id, "a", 1, StepRunUpdate { status: Some("completed".into()), output: Some(Some("{\"x\":1}".into())), ..Default::default() })
            .await
            .unwrap();

        let steps = store.list_step_runs(&run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, "completed");
    }

    #[tokio::test]
    async fn run_events_append_only_in_order() {
        let store = setup().await;
        let wf = store
            .create_workflow(NewWorkflow { name: "demo".into(), definition: "{}".into(), input_schema: None })
            .await
            .unwrap();
        let run = store
            .create_run(NewRun { workflow_id: wf.id, trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None })
            .await
            .unwrap();

        for et in ["run.started", "step.started", "step.completed", "run.completed"] {
            store
                .create_run_event(NewRunEvent { run_id: run.id.clone(), step_id: None, event_type: et.into(), payload: "{}".into() })
                .await
                .unwrap();
        }

        let events = store.list_run_events(&run.id).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["run.started", "step.started", "step.completed", "run.completed"]);
    }
}
