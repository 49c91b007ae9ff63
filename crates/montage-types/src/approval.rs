use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventKind;
use crate::project::ProjectStatus;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    RevisionRequested,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// A checkpoint pause awaiting a human decision. The tasks the gated event
/// would have produced are persisted with the request so a restart (or a
/// late approval) can still enqueue them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub project_id: String,
    /// The gated event kind (checkpoint stage).
    pub stage: EventKind,
    pub summary: String,
    /// Content shown to the reviewer (script text, shot list, URIs...).
    #[serde(default)]
    pub content: Value,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reminder_sent: bool,
    /// Project status to restore when the approval resolves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_status: Option<ProjectStatus>,
    /// Downstream tasks deferred until the decision.
    #[serde(default)]
    pub deferred_tasks: Vec<Task>,
    /// Event id that triggered the gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gating_event_id: Option<String>,
}

impl ApprovalRequest {
    pub fn new(project_id: impl Into<String>, stage: EventKind, summary: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            stage,
            summary: summary.into(),
            content: Value::Null,
            status: ApprovalStatus::Pending,
            notes: None,
            created_at: Utc::now(),
            resolved_at: None,
            reminder_sent: false,
            prior_status: None,
            deferred_tasks: Vec::new(),
            gating_event_id: None,
        }
    }
}
