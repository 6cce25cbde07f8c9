//! Row structs for the four persisted entities (§3). Each carries its JSON
//! columns (`definition`, `input`, `context`, `output`, `payload`) as raw
//! `String`s at the sqlx boundary; callers parse/serialize at the edges
//! rather than forcing `serde_json::Value` through `FromRow`, mirroring the
//! teacher's `db::models::workflow::Workflow` (plain `String` columns,
//! typed accessors layered on top).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub version: i64,
    pub status: String,
    pub definition: String,
    pub input_schema: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Workflow {
    pub fn is_draft(&self) -> bool {
        self.status == "draft"
    }

    pub fn is_published(&self) -> bool {
        self.status == "published"
    }

    pub fn is_archived(&self) -> bool {
        self.status == "archived"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    pub status: String,
    pub trigger_type: String,
    pub input: String,
    pub context: String,
    pub error: Option<String>,
    pub idempotency_key: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Terminal statuses are sticky (invariant 1, §8): once a run reaches one of
/// these, the engine never mutates it again.
pub const TERMINAL_RUN_STATUSES: &[&str] = &["completed", "failed", "cancelled"];

impl Run {
    pub fn is_terminal(&self) -> bool {
        TERMINAL_RUN_STATUSES.contains(&self.status.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepRun {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub step_type: String,
    pub attempt: i64,
    pub status: String,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunEvent {
    pub id: String,
    pub run_id: String,
    pub step_id: Option<String>,
    pub event_type: String,
    pub payload: String,
    pub created_at: String,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
