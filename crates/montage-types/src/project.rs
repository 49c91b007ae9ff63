use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::approval::ApprovalRequest;
use crate::dna::DnaEntry;
use crate::event::EventKind;
use crate::shot::{Shot, ShotStatus};
use crate::task::Task;

/// In-aggregate change log keeps only the most recent entries; the full
/// history lives in the change-log table.
pub const CHANGE_LOG_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Planning,
    Rendering,
    Qa,
    Editing,
    ApprovalPending,
    Delivered,
    Aborted,
    Failed,
}

impl ProjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Delivered | ProjectStatus::Aborted | ProjectStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    High,
    Balanced,
    Fast,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StyleSpec {
    #[serde(default)]
    pub tone: String,
    /// Ordered hex colors, most dominant first.
    #[serde(default)]
    pub palette: Vec<String>,
    #[serde(default)]
    pub visual_dna_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOptions {
    /// When true every approval checkpoint is bypassed.
    #[serde(default)]
    pub auto_mode: bool,
    /// Event kinds that pause the project for human approval.
    #[serde(default)]
    pub approval_checkpoints: Vec<EventKind>,
    #[serde(default = "default_approval_timeout_minutes")]
    pub approval_timeout_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_preference: Option<String>,
}

fn default_approval_timeout_minutes() -> u64 {
    60
}

impl Default for UserOptions {
    fn default() -> Self {
        Self {
            auto_mode: false,
            approval_checkpoints: vec![
                EventKind::SceneWritten,
                EventKind::ShotPlanned,
                EventKind::PreviewVideoReady,
                EventKind::FinalVideoReady,
            ],
            approval_timeout_minutes: default_approval_timeout_minutes(),
            audio_preference: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSpec {
    pub title: String,
    pub duration_seconds: f64,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    pub quality_tier: QualityTier,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub style: StyleSpec,
    /// Ordered character identifiers.
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub user_options: UserOptions,
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}

fn default_resolution() -> String {
    "1920x1080".to_string()
}

fn default_fps() -> u32 {
    24
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Money {
    pub amount: f64,
    /// ISO 4217 code.
    pub currency: String,
}

impl Money {
    pub fn usd(amount: f64) -> Self {
        Self {
            amount,
            currency: "USD".to_string(),
        }
    }

    pub fn zero(currency: impl Into<String>) -> Self {
        Self {
            amount: 0.0,
            currency: currency.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub total: Money,
    pub spent: Money,
    pub estimated_remaining: Money,
    /// Category name (e.g. "image_generation") -> money.
    #[serde(default)]
    pub breakdown: HashMap<String, Money>,
    /// Linear extrapolation of the final spend from current shot progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_final: Option<Money>,
}

impl Budget {
    pub fn new(total: Money) -> Self {
        let currency = total.currency.clone();
        Self {
            spent: Money::zero(&currency),
            estimated_remaining: total.clone(),
            total,
            breakdown: HashMap::new(),
            predicted_final: None,
        }
    }

    pub fn remaining(&self) -> f64 {
        self.total.amount - self.spent.amount
    }

    /// Fraction spent of total; 0.0 for a zero budget.
    pub fn spent_ratio(&self) -> f64 {
        if self.total.amount <= f64::EPSILON {
            0.0
        } else {
            self.spent.amount / self.total.amount
        }
    }
}

/// Best-effort mirror of the Lock Service, kept in the aggregate for
/// observability. The lock table is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMirror {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    pub model: String,
    pub model_version: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub use_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: ErrorSeverity,
    /// Component or agent that produced the error.
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl ErrorEntry {
    pub fn new(severity: ErrorSeverity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            severity,
            source: source.into(),
            message: message.into(),
            recovery_attempts: 0,
            resolution: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Project version immediately after the mutation this entry describes.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub change_kind: String,
    pub description: String,
    /// JSON-pointer into the aggregate.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

/// The aggregate root: one per pipeline run. All mutation goes through the
/// state store; workers only ever see snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    /// Strictly monotonic, bumped by one on every successful write.
    pub version: u64,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub spec: GlobalSpec,
    pub budget: Budget,
    #[serde(default)]
    pub dna_bank: HashMap<String, DnaEntry>,
    #[serde(default)]
    pub shots: HashMap<String, Shot>,
    #[serde(default)]
    pub tasks: HashMap<String, Task>,
    #[serde(default)]
    pub locks: HashMap<String, LockMirror>,
    #[serde(default)]
    pub artifact_index: HashMap<String, ArtifactMeta>,
    #[serde(default)]
    pub error_log: Vec<ErrorEntry>,
    #[serde(default)]
    pub change_log: Vec<ChangeEntry>,
    #[serde(default)]
    pub approval_requests: HashMap<String, ApprovalRequest>,
    #[serde(default)]
    pub approval_history: Vec<ApprovalRequest>,
}

impl Project {
    pub fn new(id: impl Into<String>, spec: GlobalSpec, budget: Budget) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            version: 1,
            status: ProjectStatus::Created,
            created_at: now,
            updated_at: now,
            spec,
            budget,
            dna_bank: HashMap::new(),
            shots: HashMap::new(),
            tasks: HashMap::new(),
            locks: HashMap::new(),
            artifact_index: HashMap::new(),
            error_log: Vec::new(),
            change_log: Vec::new(),
            approval_requests: HashMap::new(),
            approval_history: Vec::new(),
        }
    }

    /// Fraction of shots at or past PreviewReady. Drives the linear
    /// final-cost prediction.
    pub fn shot_progress(&self) -> f64 {
        if self.shots.is_empty() {
            return 0.0;
        }
        let advanced = self
            .shots
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    ShotStatus::PreviewReady
                        | ShotStatus::QaPassed
                        | ShotStatus::Approved
                        | ShotStatus::FinalRendered
                )
            })
            .count();
        advanced as f64 / self.shots.len() as f64
    }

    /// Append a change entry, evicting the oldest past the in-aggregate cap.
    pub fn push_change(&mut self, entry: ChangeEntry) {
        self.change_log.push(entry);
        if self.change_log.len() > CHANGE_LOG_CAP {
            let excess = self.change_log.len() - CHANGE_LOG_CAP;
            self.change_log.drain(..excess);
        }
    }
}
