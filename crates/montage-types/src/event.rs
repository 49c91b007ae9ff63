use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Every kind of event that can cross the bus. One durable stream exists per
/// kind; the snake_case wire name doubles as the stream name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProjectCreated,
    ProjectStatusChanged,
    ProjectFinalized,
    ProjectAborted,
    SceneWritten,
    ShotPlanned,
    ImageGenerated,
    FeaturesExtracted,
    DnaBankUpdated,
    PromptsAdjusted,
    QaReport,
    PreviewVideoReady,
    ShotApproved,
    FinalVideoReady,
    MusicGenerated,
    VoiceGenerated,
    AssemblyCompleted,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskTimedOut,
    UserApprovalRequired,
    UserApproved,
    UserRevisionRequested,
    UserRejected,
    ApprovalReminder,
    ApprovalTimedOut,
    CostOverrunWarning,
    BudgetExhausted,
    QueuePressure,
    HumanGateTriggered,
    ErrorOccurred,
    ForceAbort,
}

impl EventKind {
    pub const ALL: [EventKind; 34] = [
        EventKind::ProjectCreated,
        EventKind::ProjectStatusChanged,
        EventKind::ProjectFinalized,
        EventKind::ProjectAborted,
        EventKind::SceneWritten,
        EventKind::ShotPlanned,
        EventKind::ImageGenerated,
        EventKind::FeaturesExtracted,
        EventKind::DnaBankUpdated,
        EventKind::PromptsAdjusted,
        EventKind::QaReport,
        EventKind::PreviewVideoReady,
        EventKind::ShotApproved,
        EventKind::FinalVideoReady,
        EventKind::MusicGenerated,
        EventKind::VoiceGenerated,
        EventKind::AssemblyCompleted,
        EventKind::TaskAssigned,
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
        EventKind::TaskCancelled,
        EventKind::TaskTimedOut,
        EventKind::UserApprovalRequired,
        EventKind::UserApproved,
        EventKind::UserRevisionRequested,
        EventKind::UserRejected,
        EventKind::ApprovalReminder,
        EventKind::ApprovalTimedOut,
        EventKind::CostOverrunWarning,
        EventKind::BudgetExhausted,
        EventKind::QueuePressure,
        EventKind::HumanGateTriggered,
        EventKind::ErrorOccurred,
        EventKind::ForceAbort,
    ];

    /// Stream name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ProjectCreated => "project_created",
            EventKind::ProjectStatusChanged => "project_status_changed",
            EventKind::ProjectFinalized => "project_finalized",
            EventKind::ProjectAborted => "project_aborted",
            EventKind::SceneWritten => "scene_written",
            EventKind::ShotPlanned => "shot_planned",
            EventKind::ImageGenerated => "image_generated",
            EventKind::FeaturesExtracted => "features_extracted",
            EventKind::DnaBankUpdated => "dna_bank_updated",
            EventKind::PromptsAdjusted => "prompts_adjusted",
            EventKind::QaReport => "qa_report",
            EventKind::PreviewVideoReady => "preview_video_ready",
            EventKind::ShotApproved => "shot_approved",
            EventKind::FinalVideoReady => "final_video_ready",
            EventKind::MusicGenerated => "music_generated",
            EventKind::VoiceGenerated => "voice_generated",
            EventKind::AssemblyCompleted => "assembly_completed",
            EventKind::TaskAssigned => "task_assigned",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskCancelled => "task_cancelled",
            EventKind::TaskTimedOut => "task_timed_out",
            EventKind::UserApprovalRequired => "user_approval_required",
            EventKind::UserApproved => "user_approved",
            EventKind::UserRevisionRequested => "user_revision_requested",
            EventKind::UserRejected => "user_rejected",
            EventKind::ApprovalReminder => "approval_reminder",
            EventKind::ApprovalTimedOut => "approval_timed_out",
            EventKind::CostOverrunWarning => "cost_overrun_warning",
            EventKind::BudgetExhausted => "budget_exhausted",
            EventKind::QueuePressure => "queue_pressure",
            EventKind::HumanGateTriggered => "human_gate_triggered",
            EventKind::ErrorOccurred => "error_occurred",
            EventKind::ForceAbort => "force_abort",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| CoreError::Validation(format!("unknown event kind `{s}`")))
    }
}

/// Delivery bookkeeping carried alongside the payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
}

/// An immutable fact published by a worker or the orchestrator.
///
/// `causation_id` points at the event that directly triggered this one;
/// `None` marks an externally-triggered root. The resulting graph is a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub project_id: String,
    pub kind: EventKind,
    /// Name of the publishing agent.
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    /// JSON-pointer into the project aggregate naming the primary mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blackboard_pointer: Option<String>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event {
    pub fn new(
        project_id: impl Into<String>,
        kind: EventKind,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            kind,
            actor: actor.into(),
            causation_id: None,
            timestamp: Utc::now(),
            payload: Value::Null,
            blackboard_pointer: None,
            metadata: EventMetadata::default(),
        }
    }

    pub fn caused_by(mut self, event_id: impl Into<String>) -> Self {
        self.causation_id = Some(event_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.blackboard_pointer = Some(pointer.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.metadata.cost = Some(cost);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_stream_name() {
        for kind in EventKind::ALL {
            let parsed: EventKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn unknown_kind_is_a_validation_error() {
        let err = "definitely_not_a_kind".parse::<EventKind>().unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn builder_sets_causation() {
        let root = Event::new("p1", EventKind::ProjectCreated, "api");
        let child = Event::new("p1", EventKind::SceneWritten, "script_writer")
            .caused_by(root.id.clone());
        assert_eq!(child.causation_id.as_deref(), Some(root.id.as_str()));
        assert!(root.causation_id.is_none());
    }
}
