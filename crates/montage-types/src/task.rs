use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    WriteScript,
    RewriteScript,
    PlanShots,
    GenerateKeyframe,
    GeneratePreviewVideo,
    GenerateFinalVideo,
    GenerateMusic,
    GenerateVoice,
    RunVisualQa,
    RunVideoQa,
    RunAudioQa,
    ExtractFeatures,
    UpdateDnaBank,
    AdjustPrompts,
    AssembleFinal,
    PromptTuning,
    ModelSwapRetry,
    HumanReviewRequired,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::WriteScript => "write_script",
            TaskKind::RewriteScript => "rewrite_script",
            TaskKind::PlanShots => "plan_shots",
            TaskKind::GenerateKeyframe => "generate_keyframe",
            TaskKind::GeneratePreviewVideo => "generate_preview_video",
            TaskKind::GenerateFinalVideo => "generate_final_video",
            TaskKind::GenerateMusic => "generate_music",
            TaskKind::GenerateVoice => "generate_voice",
            TaskKind::RunVisualQa => "run_visual_qa",
            TaskKind::RunVideoQa => "run_video_qa",
            TaskKind::RunAudioQa => "run_audio_qa",
            TaskKind::ExtractFeatures => "extract_features",
            TaskKind::UpdateDnaBank => "update_dna_bank",
            TaskKind::AdjustPrompts => "adjust_prompts",
            TaskKind::AssembleFinal => "assemble_final",
            TaskKind::PromptTuning => "prompt_tuning",
            TaskKind::ModelSwapRetry => "model_swap_retry",
            TaskKind::HumanReviewRequired => "human_review_required",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| CoreError::Validation(format!("unknown task kind `{s}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    WaitingApproval,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A unit of work assigned to one agent. Tasks are retained forever for
/// audit; only their status moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Agent name this task dispatches to.
    pub assignee: String,
    /// 1..=5, 5 highest.
    pub priority: u8,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_event_id: Option<String>,
    /// Named lock the scheduler must hold before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_lock_key: Option<String>,
    /// Reason recorded when the task fails (timeout, budget_exhausted, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Task {
    pub fn new(project_id: impl Into<String>, kind: TaskKind, assignee: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            kind,
            status: TaskStatus::Pending,
            assignee: assignee.into(),
            priority: 3,
            depends_on: Vec::new(),
            input: Value::Null,
            output: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_cost: 0.0,
            actual_cost: None,
            causation_event_id: None,
            required_lock_key: None,
            failure_reason: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 5);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn caused_by(mut self, event_id: impl Into<String>) -> Self {
        self.causation_event_id = Some(event_id.into());
        self
    }

    pub fn with_lock(mut self, key: impl Into<String>) -> Self {
        self.required_lock_key = Some(key.into());
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_is_clamped_to_range() {
        let task = Task::new("p1", TaskKind::WriteScript, "script_writer").with_priority(9);
        assert_eq!(task.priority, 5);
        let task = Task::new("p1", TaskKind::WriteScript, "script_writer").with_priority(0);
        assert_eq!(task.priority, 1);
    }

    #[test]
    fn retry_budget_is_bounded() {
        let mut task = Task::new("p1", TaskKind::GenerateKeyframe, "image_gen");
        assert!(task.can_retry());
        task.retry_count = DEFAULT_MAX_RETRIES;
        assert!(!task.can_retry());
    }

    #[test]
    fn kind_parses_from_wire_name() {
        let kind: TaskKind = "generate_preview_video".parse().unwrap();
        assert_eq!(kind, TaskKind::GeneratePreviewVideo);
    }
}
