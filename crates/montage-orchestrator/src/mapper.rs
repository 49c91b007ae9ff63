//! Declarative event-to-task mapping.
//!
//! The table is data: it serializes to JSON, can be edited on disk, and is
//! reloaded without recompiling the scheduler. Rules match an event kind
//! plus optional payload conditions and emit task templates; per-kind
//! defaults supply priority, assignee, estimated cost, and the lock scope a
//! task must hold. Dependencies between emitted tasks are wired by the
//! orchestrator, not here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;

use montage_types::{
    CoreError, CoreResult, Event, EventKind, Project, Task, TaskKind, TaskStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    Shot,
    DnaBank,
    GlobalStyle,
    ShotsScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefaults {
    pub priority: u8,
    pub assignee: String,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockScope>,
}

/// Tier-2 recovery: a cheaper variant substituted when the budget gate
/// rejects the full-cost task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSpec {
    pub variant: String,
    pub cost_multiplier: f64,
}

/// Payload condition: the named top-level payload field must equal `equals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMatch {
    pub field: String,
    pub equals: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub kind: TaskKind,
    /// Emit one task per element of `payload.shots`.
    #[serde(default)]
    pub fan_out_shots: bool,
    /// Skip when a live task of this kind already exists for the project.
    #[serde(default)]
    pub skip_if_exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Payload keys copied into the task input; `None` copies the whole
    /// payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_keys: Option<Vec<String>>,
}

impl TaskTemplate {
    fn of(kind: TaskKind) -> Self {
        Self {
            kind,
            fan_out_shots: false,
            skip_if_exists: false,
            priority: None,
            input_keys: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapRule {
    pub on: EventKind,
    #[serde(default)]
    pub when: Vec<PayloadMatch>,
    /// Only fire once every shot in the project is final-rendered.
    #[serde(default)]
    pub require_all_shots_final: bool,
    pub emit: Vec<TaskTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperTable {
    pub rules: Vec<MapRule>,
    pub defaults: HashMap<TaskKind, TaskDefaults>,
    pub fallbacks: HashMap<TaskKind, FallbackSpec>,
    /// Checkpoint stage -> task emitted on a revision request.
    pub revisions: HashMap<EventKind, TaskKind>,
    /// Checkpoint stage -> full-redo task emitted on rejection.
    pub redos: HashMap<EventKind, TaskKind>,
}

impl MapperTable {
    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(CoreError::from)
    }

    pub fn save(&self, path: &Path) -> CoreResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Pure mapping: event (+ current aggregate for conditions) to concrete
    /// tasks. Emitted tasks carry causation, priority, assignee, estimated
    /// cost, input projection, and the required lock key; dependencies stay
    /// empty for the orchestrator to fill.
    pub fn map(&self, event: &Event, project: &Project) -> Vec<Task> {
        let mut tasks = Vec::new();
        for rule in &self.rules {
            if rule.on != event.kind || !self.conditions_match(rule, event) {
                continue;
            }
            if rule.require_all_shots_final && !all_shots_final(project) {
                continue;
            }
            for template in &rule.emit {
                if template.skip_if_exists && has_live_task(project, template.kind) {
                    continue;
                }
                if template.fan_out_shots {
                    for shot_id in payload_shot_ids(&event.payload) {
                        tasks.push(self.build_task(template, event, Some(&shot_id)));
                    }
                } else {
                    let shot_id = event
                        .payload
                        .get("shot_id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    tasks.push(self.build_task(template, event, shot_id.as_deref()));
                }
            }
        }
        tasks
    }

    fn conditions_match(&self, rule: &MapRule, event: &Event) -> bool {
        rule.when
            .iter()
            .all(|m| event.payload.get(&m.field) == Some(&m.equals))
    }

    fn build_task(&self, template: &TaskTemplate, event: &Event, shot_id: Option<&str>) -> Task {
        let defaults = self.defaults_for(template.kind);
        let mut input = Map::new();
        input.insert("project_id".to_string(), json!(event.project_id));
        if let Some(shot_id) = shot_id {
            input.insert("shot_id".to_string(), json!(shot_id));
        }
        match (&template.input_keys, event.payload.as_object()) {
            (Some(keys), Some(payload)) => {
                for key in keys {
                    if let Some(value) = payload.get(key) {
                        input.insert(key.clone(), value.clone());
                    }
                }
            }
            (None, Some(payload)) => {
                for (key, value) in payload {
                    input.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            _ => {}
        }
        let mut task = Task::new(&event.project_id, template.kind, &defaults.assignee)
            .with_priority(template.priority.unwrap_or(defaults.priority))
            .with_estimated_cost(defaults.estimated_cost)
            .with_input(Value::Object(input))
            .caused_by(&event.id);
        if let Some(key) = self.lock_key(defaults.lock, &event.project_id, shot_id) {
            task = task.with_lock(key);
        }
        task
    }

    fn lock_key(
        &self,
        scope: Option<LockScope>,
        project_id: &str,
        shot_id: Option<&str>,
    ) -> Option<String> {
        match scope? {
            LockScope::Shot => shot_id.map(|s| montage_locks::keys::shot(project_id, s)),
            LockScope::DnaBank => Some(montage_locks::keys::dna_bank(project_id)),
            LockScope::GlobalStyle => Some(montage_locks::keys::global_style(project_id)),
            LockScope::ShotsScope => Some(montage_locks::keys::shots_scope(project_id)),
        }
    }

    /// Build a single task of `kind` outside the rule table (revision and
    /// redo tasks), still honoring the per-kind defaults.
    pub fn instantiate(
        &self,
        kind: TaskKind,
        project_id: &str,
        input: Value,
        causation_event_id: &str,
    ) -> Task {
        let defaults = self.defaults_for(kind);
        let shot_id = input
            .get("shot_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut task = Task::new(project_id, kind, &defaults.assignee)
            .with_priority(defaults.priority)
            .with_estimated_cost(defaults.estimated_cost)
            .with_input(input)
            .caused_by(causation_event_id);
        if let Some(key) = self.lock_key(defaults.lock, project_id, shot_id.as_deref()) {
            task = task.with_lock(key);
        }
        task
    }

    pub fn defaults_for(&self, kind: TaskKind) -> TaskDefaults {
        self.defaults.get(&kind).cloned().unwrap_or(TaskDefaults {
            priority: 3,
            assignee: "unassigned".to_string(),
            estimated_cost: 0.0,
            lock: None,
        })
    }

    pub fn fallback_for(&self, kind: TaskKind) -> Option<&FallbackSpec> {
        self.fallbacks.get(&kind)
    }

    pub fn revision_task_for(&self, stage: EventKind) -> Option<TaskKind> {
        self.revisions.get(&stage).copied()
    }

    pub fn redo_task_for(&self, stage: EventKind) -> Option<TaskKind> {
        self.redos.get(&stage).copied()
    }
}

fn all_shots_final(project: &Project) -> bool {
    !project.shots.is_empty()
        && project
            .shots
            .values()
            .all(|s| s.status == montage_types::ShotStatus::FinalRendered)
}

fn has_live_task(project: &Project, kind: TaskKind) -> bool {
    project.tasks.values().any(|t| {
        t.kind == kind && !matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled)
    })
}

/// Shot ids from a `shots` payload array of either ids or shot objects.
fn payload_shot_ids(payload: &Value) -> Vec<String> {
    payload
        .get("shots")
        .and_then(Value::as_array)
        .map(|shots| {
            shots
                .iter()
                .filter_map(|s| {
                    s.as_str()
                        .map(str::to_string)
                        .or_else(|| s.get("id").and_then(Value::as_str).map(str::to_string))
                })
                .collect()
        })
        .unwrap_or_default()
}

impl Default for MapperTable {
    fn default() -> Self {
        let mut defaults = HashMap::new();
        let mut insert = |kind: TaskKind, priority: u8, assignee: &str, cost: f64, lock: Option<LockScope>| {
            defaults.insert(
                kind,
                TaskDefaults {
                    priority,
                    assignee: assignee.to_string(),
                    estimated_cost: cost,
                    lock,
                },
            );
        };
        insert(TaskKind::WriteScript, 5, "script_writer", 0.05, None);
        insert(TaskKind::RewriteScript, 5, "script_writer", 0.05, None);
        insert(TaskKind::PlanShots, 5, "shot_planner", 0.02, Some(LockScope::ShotsScope));
        insert(TaskKind::GenerateKeyframe, 4, "image_generator", 0.35, Some(LockScope::Shot));
        insert(TaskKind::GeneratePreviewVideo, 4, "video_generator", 0.9, Some(LockScope::Shot));
        insert(TaskKind::GenerateFinalVideo, 4, "video_generator", 1.6, Some(LockScope::Shot));
        insert(TaskKind::GenerateMusic, 2, "audio_generator", 0.4, None);
        insert(TaskKind::GenerateVoice, 2, "audio_generator", 0.3, None);
        insert(TaskKind::RunVisualQa, 3, "qa_agent", 0.05, None);
        insert(TaskKind::RunVideoQa, 3, "qa_agent", 0.05, None);
        insert(TaskKind::RunAudioQa, 3, "qa_agent", 0.05, None);
        insert(TaskKind::ExtractFeatures, 3, "dna_curator", 0.02, None);
        insert(TaskKind::UpdateDnaBank, 3, "dna_curator", 0.0, Some(LockScope::DnaBank));
        insert(TaskKind::AdjustPrompts, 2, "prompt_engineer", 0.02, Some(LockScope::GlobalStyle));
        insert(TaskKind::AssembleFinal, 5, "editor", 0.2, None);
        insert(TaskKind::PromptTuning, 4, "prompt_engineer", 0.05, None);
        insert(TaskKind::ModelSwapRetry, 4, "image_generator", 0.35, Some(LockScope::Shot));
        insert(TaskKind::HumanReviewRequired, 5, "admin", 0.0, None);

        let rules = vec![
            MapRule {
                on: EventKind::ProjectCreated,
                when: vec![],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::WriteScript)],
            },
            MapRule {
                on: EventKind::SceneWritten,
                when: vec![],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::PlanShots)],
            },
            MapRule {
                on: EventKind::ShotPlanned,
                when: vec![],
                require_all_shots_final: false,
                emit: vec![TaskTemplate {
                    fan_out_shots: true,
                    ..TaskTemplate::of(TaskKind::GenerateKeyframe)
                }],
            },
            MapRule {
                on: EventKind::ImageGenerated,
                when: vec![],
                require_all_shots_final: false,
                emit: vec![
                    TaskTemplate::of(TaskKind::ExtractFeatures),
                    TaskTemplate::of(TaskKind::RunVisualQa),
                ],
            },
            MapRule {
                on: EventKind::FeaturesExtracted,
                when: vec![],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::UpdateDnaBank)],
            },
            MapRule {
                on: EventKind::DnaBankUpdated,
                when: vec![],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::AdjustPrompts)],
            },
            MapRule {
                on: EventKind::QaReport,
                when: vec![
                    PayloadMatch { field: "media".into(), equals: json!("image") },
                    PayloadMatch { field: "status".into(), equals: json!("pass") },
                ],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::GeneratePreviewVideo)],
            },
            MapRule {
                on: EventKind::QaReport,
                when: vec![
                    PayloadMatch { field: "media".into(), equals: json!("image") },
                    PayloadMatch { field: "status".into(), equals: json!("warn") },
                ],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::GeneratePreviewVideo)],
            },
            MapRule {
                on: EventKind::QaReport,
                when: vec![PayloadMatch { field: "status".into(), equals: json!("fail") }],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::PromptTuning)],
            },
            MapRule {
                on: EventKind::PreviewVideoReady,
                when: vec![],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::RunVideoQa)],
            },
            MapRule {
                on: EventKind::ShotApproved,
                when: vec![],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::GenerateFinalVideo)],
            },
            MapRule {
                on: EventKind::FinalVideoReady,
                when: vec![],
                require_all_shots_final: true,
                emit: vec![
                    TaskTemplate::of(TaskKind::AssembleFinal),
                    TaskTemplate {
                        skip_if_exists: true,
                        ..TaskTemplate::of(TaskKind::GenerateMusic)
                    },
                    TaskTemplate {
                        skip_if_exists: true,
                        ..TaskTemplate::of(TaskKind::GenerateVoice)
                    },
                ],
            },
            MapRule {
                on: EventKind::HumanGateTriggered,
                when: vec![],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::HumanReviewRequired)],
            },
            // Tuning finished: regenerate the keyframe with the tuned prompt.
            MapRule {
                on: EventKind::TaskCompleted,
                when: vec![PayloadMatch { field: "kind".into(), equals: json!("prompt_tuning") }],
                require_all_shots_final: false,
                emit: vec![TaskTemplate::of(TaskKind::GenerateKeyframe)],
            },
        ];

        let mut fallbacks = HashMap::new();
        fallbacks.insert(
            TaskKind::GeneratePreviewVideo,
            FallbackSpec { variant: "still_motion".into(), cost_multiplier: 0.3 },
        );
        fallbacks.insert(
            TaskKind::GenerateFinalVideo,
            FallbackSpec { variant: "preview_upscale".into(), cost_multiplier: 0.5 },
        );
        fallbacks.insert(
            TaskKind::GenerateMusic,
            FallbackSpec { variant: "stock_loop".into(), cost_multiplier: 0.2 },
        );

        let mut revisions = HashMap::new();
        revisions.insert(EventKind::SceneWritten, TaskKind::RewriteScript);
        revisions.insert(EventKind::ShotPlanned, TaskKind::PlanShots);
        revisions.insert(EventKind::PreviewVideoReady, TaskKind::GeneratePreviewVideo);
        revisions.insert(EventKind::FinalVideoReady, TaskKind::GenerateFinalVideo);

        let mut redos = HashMap::new();
        redos.insert(EventKind::SceneWritten, TaskKind::WriteScript);
        redos.insert(EventKind::ShotPlanned, TaskKind::PlanShots);
        redos.insert(EventKind::PreviewVideoReady, TaskKind::GeneratePreviewVideo);
        redos.insert(EventKind::FinalVideoReady, TaskKind::GenerateFinalVideo);

        Self { rules, defaults, fallbacks, revisions, redos }
    }
}
