//! End-to-end pipeline scenarios with stub worker agents.
//!
//! The stubs synthesize artifacts instantly and publish the same events the
//! real model-wrapping agents would, so the full coordination loop runs:
//! mapping, gating, locking, scheduling, and causation tracking.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use montage_orchestrator::{reduce, MontageConfig, Orchestrator, WorkerAgent, WorkerContext};
use montage_state::WriteCtx;
use montage_types::{
    ApprovalStatus, ArtifactMeta, Budget, CoreError, CoreResult, DnaVersion, Event, EventKind,
    GlobalSpec, Money, ProjectStatus, QualityTier, Shot, ShotStatus, StyleSpec, Task, TaskKind,
    TaskStatus, UserOptions,
};

fn test_config(dir: &std::path::Path) -> MontageConfig {
    MontageConfig {
        state_dir: dir.to_path_buf(),
        scheduler_tick_ms: 20,
        watchdog_tick_ms: 100,
        approval_scan_ms: 100,
        ..MontageConfig::default()
    }
}

fn spec(duration: f64, auto_mode: bool, checkpoints: Vec<EventKind>) -> GlobalSpec {
    GlobalSpec {
        title: "Sunrise over the harbor".into(),
        duration_seconds: duration,
        aspect_ratio: "16:9".into(),
        quality_tier: QualityTier::Balanced,
        resolution: "1920x1080".into(),
        fps: 24,
        style: StyleSpec {
            tone: "warm".into(),
            palette: vec!["#ff9a3c".into(), "#2b2d42".into()],
            visual_dna_version: 1,
        },
        characters: vec!["hero".into()],
        mood: "hopeful".into(),
        user_options: UserOptions {
            auto_mode,
            approval_checkpoints: checkpoints,
            approval_timeout_minutes: 60,
            audio_preference: None,
        },
    }
}

/// One stub implementation covering every pipeline role; registered once
/// per assignee name.
struct StubAgent {
    name: String,
    /// Scripted visual-QA outcomes, oldest first; exhausted plan = pass.
    qa_plan: Arc<Mutex<VecDeque<&'static str>>>,
    keyframe_cost: f64,
    video_cost: f64,
}

impl StubAgent {
    async fn emit(
        &self,
        ctx: &WorkerContext,
        project_id: &str,
        kind: EventKind,
        payload: Value,
    ) -> CoreResult<()> {
        ctx.events
            .publish(
                Event::new(project_id, kind, self.name.as_str())
                    .caused_by(&ctx.assignment_event_id)
                    .with_payload(payload),
            )
            .await?;
        Ok(())
    }

    fn shot_id(task: &Task) -> CoreResult<String> {
        task.input
            .get("shot_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoreError::Validation(format!("task `{}` missing shot_id", task.id)))
    }
}

#[async_trait]
impl WorkerAgent for StubAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> CoreResult<Value> {
        let project_id = task.project_id.as_str();
        let wctx = WriteCtx::actor(self.name.as_str()).caused_by(&ctx.assignment_event_id);
        match task.kind {
            TaskKind::WriteScript | TaskKind::RewriteScript => {
                let mut payload = json!({
                    "content": "EXT. HARBOR - DAWN. The hero watches the first light.",
                });
                if let Some(notes) = task.input.get("revision_notes") {
                    payload["revision_applied"] = notes.clone();
                }
                self.emit(ctx, project_id, EventKind::SceneWritten, payload).await?;
                Ok(json!({ "script": "EXT. HARBOR - DAWN" }))
            }
            TaskKind::PlanShots => {
                let spec = ctx.state.get_global_spec(project_id).await?;
                let count = ((spec.duration_seconds / 6.0).ceil() as usize).max(1);
                let mut patches = HashMap::new();
                let mut ids = Vec::new();
                for i in 0..count {
                    let id = format!("S{:02}", i + 1);
                    patches.insert(id.clone(), serde_json::to_value(Shot::new(&id, i as u32, 6.0))?);
                    ids.push(json!({ "id": id }));
                }
                ctx.state
                    .batch_update_shots(project_id, patches, &wctx, &task.id)
                    .await?;
                self.emit(ctx, project_id, EventKind::ShotPlanned, json!({ "shots": ids }))
                    .await?;
                Ok(json!({ "planned": count }))
            }
            TaskKind::GenerateKeyframe => {
                let shot_id = Self::shot_id(task)?;
                if self.keyframe_cost > 0.0 {
                    ctx.record_cost(project_id, self.keyframe_cost, "image_generation", "keyframe")
                        .await?;
                }
                let uri = format!("blob://{project_id}/{shot_id}/kf-{}.png", task.retry_count);
                ctx.state
                    .register_artifact(
                        project_id,
                        &uri,
                        ArtifactMeta {
                            seed: Some(42),
                            model: "imageforge".into(),
                            model_version: "2.1".into(),
                            prompt: "hero at dawn".into(),
                            cost: self.keyframe_cost,
                            created_at: Utc::now(),
                            use_count: 0,
                        },
                        &wctx,
                    )
                    .await?;
                let mut shot = ctx.state.get_shot(project_id, &shot_id).await?;
                shot.status = ShotStatus::KeyframeGenerated;
                shot.keyframes.start = Some(uri.clone());
                ctx.state
                    .update_shot(project_id, &shot_id, shot, &wctx, &task.id)
                    .await?;
                self.emit(
                    ctx,
                    project_id,
                    EventKind::ImageGenerated,
                    json!({ "shot_id": shot_id, "artifact": uri }),
                )
                .await?;
                Ok(json!({ "artifact": uri }))
            }
            TaskKind::ExtractFeatures => {
                let shot_id = Self::shot_id(task)?;
                self.emit(
                    ctx,
                    project_id,
                    EventKind::FeaturesExtracted,
                    json!({ "shot_id": shot_id, "entity_id": "hero" }),
                )
                .await?;
                Ok(json!({ "entity_id": "hero" }))
            }
            TaskKind::UpdateDnaBank => {
                let mut entry = ctx
                    .state
                    .get_dna_bank(project_id)
                    .await?
                    .remove("hero")
                    .unwrap_or_default();
                entry.push_version(DnaVersion {
                    version: entry.versions.len() as u32 + 1,
                    weight: 1.0,
                    source_artifact: task
                        .input
                        .get("artifact")
                        .and_then(Value::as_str)
                        .unwrap_or("blob://unknown")
                        .to_string(),
                    confidence: 0.92,
                    created_at: Utc::now(),
                    vector: vec![7; 16],
                });
                ctx.state
                    .update_dna_bank(project_id, "hero", entry, &wctx, &task.id)
                    .await?;
                self.emit(
                    ctx,
                    project_id,
                    EventKind::DnaBankUpdated,
                    json!({ "entity_id": "hero" }),
                )
                .await?;
                Ok(json!({ "entity_id": "hero" }))
            }
            TaskKind::AdjustPrompts => {
                self.emit(ctx, project_id, EventKind::PromptsAdjusted, json!({}))
                    .await?;
                Ok(json!({ "adjusted": true }))
            }
            TaskKind::PromptTuning => Ok(json!({ "tuned_prompt": "hero at dawn, steady gaze" })),
            TaskKind::RunVisualQa => {
                let shot_id = Self::shot_id(task)?;
                let verdict = self.qa_plan.lock().await.pop_front().unwrap_or("pass");
                let payload = if verdict == "fail" {
                    json!({
                        "shot_id": shot_id, "media": "image", "status": "fail",
                        "scores": { "face_identity": 0.68 },
                        "thresholds": { "face_identity": 0.75 },
                    })
                } else {
                    json!({
                        "shot_id": shot_id, "media": "image", "status": verdict,
                        "scores": { "face_identity": 0.91 },
                        "thresholds": { "face_identity": 0.75 },
                    })
                };
                self.emit(ctx, project_id, EventKind::QaReport, payload).await?;
                Ok(json!({ "status": verdict }))
            }
            TaskKind::RunVideoQa => {
                let shot_id = Self::shot_id(task)?;
                self.emit(
                    ctx,
                    project_id,
                    EventKind::QaReport,
                    json!({
                        "shot_id": shot_id, "media": "video", "status": "pass",
                        "scores": { "motion_consistency": 0.88 },
                        "thresholds": { "motion_consistency": 0.7 },
                    }),
                )
                .await?;
                Ok(json!({ "status": "pass" }))
            }
            TaskKind::GeneratePreviewVideo => {
                let shot_id = Self::shot_id(task)?;
                if self.video_cost > 0.0 {
                    ctx.record_cost(project_id, self.video_cost, "video_generation", "preview")
                        .await?;
                }
                let uri = format!("blob://{project_id}/{shot_id}/preview.mp4");
                let mut shot = ctx.state.get_shot(project_id, &shot_id).await?;
                shot.status = ShotStatus::PreviewReady;
                shot.preview_video = Some(uri.clone());
                ctx.state
                    .update_shot(project_id, &shot_id, shot, &wctx, &task.id)
                    .await?;
                self.emit(
                    ctx,
                    project_id,
                    EventKind::PreviewVideoReady,
                    json!({ "shot_id": shot_id, "preview_video": uri }),
                )
                .await?;
                Ok(json!({ "preview_video": uri }))
            }
            TaskKind::GenerateFinalVideo => {
                let shot_id = Self::shot_id(task)?;
                if self.video_cost > 0.0 {
                    ctx.record_cost(project_id, self.video_cost, "video_generation", "final")
                        .await?;
                }
                let uri = format!("blob://{project_id}/{shot_id}/final.mp4");
                let mut shot = ctx.state.get_shot(project_id, &shot_id).await?;
                shot.status = ShotStatus::FinalRendered;
                shot.final_video = Some(uri.clone());
                ctx.state
                    .update_shot(project_id, &shot_id, shot, &wctx, &task.id)
                    .await?;
                self.emit(
                    ctx,
                    project_id,
                    EventKind::FinalVideoReady,
                    json!({ "shot_id": shot_id, "final_video": uri }),
                )
                .await?;
                Ok(json!({ "final_video": uri }))
            }
            TaskKind::GenerateMusic => {
                self.emit(
                    ctx,
                    project_id,
                    EventKind::MusicGenerated,
                    json!({ "music": "blob://music.wav" }),
                )
                .await?;
                Ok(json!({ "music": "blob://music.wav" }))
            }
            TaskKind::GenerateVoice => {
                self.emit(
                    ctx,
                    project_id,
                    EventKind::VoiceGenerated,
                    json!({ "voice": "blob://voice.wav" }),
                )
                .await?;
                Ok(json!({ "voice": "blob://voice.wav" }))
            }
            TaskKind::AssembleFinal => {
                let uri = format!("blob://{project_id}/final.mp4");
                self.emit(
                    ctx,
                    project_id,
                    EventKind::AssemblyCompleted,
                    json!({ "final_video": uri }),
                )
                .await?;
                Ok(json!({ "final_video": uri }))
            }
            _ => Ok(json!({})),
        }
    }
}

async fn register_stubs(
    orch: &Orchestrator,
    qa_plan: Arc<Mutex<VecDeque<&'static str>>>,
    keyframe_cost: f64,
    video_cost: f64,
) {
    for name in [
        "script_writer",
        "shot_planner",
        "image_generator",
        "video_generator",
        "audio_generator",
        "qa_agent",
        "dna_curator",
        "prompt_engineer",
        "editor",
    ] {
        orch.register_worker(Arc::new(StubAgent {
            name: name.to_string(),
            qa_plan: qa_plan.clone(),
            keyframe_cost,
            video_cost,
        }))
        .await;
    }
}

async fn wait_for_status(
    orch: &Orchestrator,
    project_id: &str,
    expected: ProjectStatus,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok((_, status)) = orch.project_status(project_id).await {
            if status == expected {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {project_id} to reach {expected:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_task(
    orch: &Orchestrator,
    project_id: &str,
    kind: TaskKind,
    status: Option<TaskStatus>,
    timeout: Duration,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(tasks) = orch.list_tasks(project_id, status, None).await {
            if let Some(task) = tasks.into_iter().find(|t| t.kind == kind) {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for a {kind} task in {project_id}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_event(
    orch: &Orchestrator,
    project_id: &str,
    kind: EventKind,
    timeout: Duration,
) -> Event {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let events = orch
            .events
            .replay(project_id, Some(&[kind]), None, None)
            .await
            .unwrap_or_default();
        if let Some(event) = events.into_iter().next() {
            return event;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {kind} in {project_id}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// Scenario 1: happy path, one shot, auto mode. Terminal state DELIVERED
// with the shot final-rendered within budget.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_single_shot_auto_mode() {
    let tmp = tempfile::TempDir::new().unwrap();
    let orch = Orchestrator::open(test_config(tmp.path())).unwrap();
    register_stubs(&orch, Arc::new(Mutex::new(VecDeque::new())), 0.35, 0.9).await;
    orch.start().await.unwrap();

    orch.create_project("P1", spec(6.0, true, vec![]), Budget::new(Money::usd(20.0)))
        .await
        .unwrap();

    wait_for_status(&orch, "P1", ProjectStatus::Delivered, Duration::from_secs(30)).await;

    let project = orch.state.get_project_uncached("P1").await.unwrap();
    let shot = &project.shots["S01"];
    assert_eq!(shot.status, ShotStatus::FinalRendered);
    assert!(shot.final_video.is_some());
    assert!(project.budget.spent.amount <= project.budget.total.amount);
    assert!(!project.artifact_index.is_empty());
    assert!(project.dna_bank.contains_key("hero"));

    // The change log recorded the whole journey.
    let kinds: Vec<&str> = project
        .change_log
        .iter()
        .map(|entry| entry.change_kind.as_str())
        .collect();
    for expected in [
        "batch_update_shots",
        "update_shot",
        "update_dna_bank",
        "register_artifact",
        "add_cost",
        "update_status",
    ] {
        assert!(kinds.contains(&expected), "missing change kind {expected}");
    }

    // Version is strictly monotonic and matches the last change entry.
    assert_eq!(
        project.change_log.last().unwrap().version,
        project.version
    );

    // Every completed task carries output and a completion timestamp.
    for task in project.tasks.values() {
        if task.status == TaskStatus::Completed {
            assert!(task.output.is_some(), "task {} lacks output", task.id);
            assert!(task.completed_at.is_some());
        }
    }

    // Replay law: folding the event log agrees with the aggregate.
    let events = orch.events.replay("P1", None, None, None).await.unwrap();
    let view = reduce(&events);
    assert_eq!(view.status, Some(ProjectStatus::Delivered));
    assert_eq!(view.shot_statuses["S01"], ShotStatus::FinalRendered);

    orch.stop();
}

// Scenario 6: the causation chain of the finalization event reaches back
// to the root with no gaps and no cycles.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn causation_chain_runs_root_to_finalized() {
    let tmp = tempfile::TempDir::new().unwrap();
    let orch = Orchestrator::open(test_config(tmp.path())).unwrap();
    register_stubs(&orch, Arc::new(Mutex::new(VecDeque::new())), 0.1, 0.1).await;
    orch.start().await.unwrap();

    orch.create_project("P6", spec(6.0, true, vec![]), Budget::new(Money::usd(20.0)))
        .await
        .unwrap();
    wait_for_status(&orch, "P6", ProjectStatus::Delivered, Duration::from_secs(30)).await;

    let finalized = wait_for_event(&orch, "P6", EventKind::ProjectFinalized, Duration::from_secs(5)).await;
    let chain = orch.events.causation_chain(&finalized.id).await.unwrap();
    assert!(chain.len() >= 5);
    assert_eq!(chain.first().unwrap().kind, EventKind::ProjectCreated);
    assert!(chain.first().unwrap().causation_id.is_none());
    assert_eq!(chain.last().unwrap().kind, EventKind::ProjectFinalized);
    // Contiguous links, no gaps.
    for pair in chain.windows(2) {
        assert_eq!(pair[1].causation_id.as_deref(), Some(pair[0].id.as_str()));
    }
    // Acyclic: every id distinct.
    let mut ids: Vec<&str> = chain.iter().map(|e| e.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), chain.len());

    orch.stop();
}

// Scenario 2: budget exhaustion. Crossing 80% warns; once spend exceeds the
// total, the next costed task fails and the project pauses at the human
// gate.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn budget_exhaustion_pauses_at_human_gate() {
    let tmp = tempfile::TempDir::new().unwrap();
    let orch = Orchestrator::open(test_config(tmp.path())).unwrap();
    // Five shots at 1.0 each: the fourth keyframe crosses the 80% warning
    // threshold, the fifth lands exactly on the total, and every costed
    // task after that is denied.
    register_stubs(&orch, Arc::new(Mutex::new(VecDeque::new())), 1.0, 0.0).await;
    orch.start().await.unwrap();

    orch.create_project("P2", spec(30.0, true, vec![]), Budget::new(Money::usd(5.0)))
        .await
        .unwrap();

    wait_for_event(&orch, "P2", EventKind::CostOverrunWarning, Duration::from_secs(30)).await;
    wait_for_event(&orch, "P2", EventKind::BudgetExhausted, Duration::from_secs(30)).await;
    wait_for_event(&orch, "P2", EventKind::HumanGateTriggered, Duration::from_secs(30)).await;
    wait_for_status(&orch, "P2", ProjectStatus::ApprovalPending, Duration::from_secs(30)).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let denied = loop {
        let failed = orch
            .list_tasks("P2", Some(TaskStatus::Failed), None)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.failure_reason.as_deref() == Some("budget_exhausted"));
        if let Some(task) = failed {
            break task;
        }
        assert!(tokio::time::Instant::now() < deadline, "no budget-denied task");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert!(denied.estimated_cost > 0.0);

    let pending = orch.list_pending_approvals("P2").await.unwrap();
    assert!(!pending.is_empty());
    assert_eq!(pending[0].stage, EventKind::HumanGateTriggered);

    orch.stop();
}

// Scenario 3: a failing visual QA report routes through prompt tuning into
// a second keyframe attempt that carries the retry lineage.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn qa_failure_retries_through_prompt_tuning() {
    let tmp = tempfile::TempDir::new().unwrap();
    let orch = Orchestrator::open(test_config(tmp.path())).unwrap();
    register_stubs(&orch, Arc::new(Mutex::new(VecDeque::new())), 0.1, 0.1).await;
    orch.start().await.unwrap();

    orch.create_project("P3", spec(6.0, true, vec![]), Budget::new(Money::usd(20.0)))
        .await
        .unwrap();
    let ctx = WriteCtx::actor("test");
    let mut shot = Shot::new("S02", 1, 6.0);
    shot.status = ShotStatus::KeyframeGenerated;
    let mut patches = HashMap::new();
    patches.insert("S02".to_string(), serde_json::to_value(&shot).unwrap());
    orch.locks
        .acquire(&montage_locks::keys::shots_scope("P3"), "test", Duration::from_secs(30))
        .unwrap();
    orch.state
        .batch_update_shots("P3", patches, &ctx, "test")
        .await
        .unwrap();
    orch.locks
        .release(&montage_locks::keys::shots_scope("P3"), "test")
        .unwrap();
    let mut prior = Task::new("P3", TaskKind::GenerateKeyframe, "image_generator")
        .with_input(json!({ "shot_id": "S02" }));
    prior.status = TaskStatus::Completed;
    prior.output = Some(json!({ "artifact": "blob://P3/S02/kf-0.png" }));
    prior.completed_at = Some(Utc::now());
    orch.state.put_task("P3", prior, &ctx).await.unwrap();

    // Inject the failing QA report.
    orch.events
        .publish(Event::new("P3", EventKind::QaReport, "qa_agent").with_payload(json!({
            "shot_id": "S02", "media": "image", "status": "fail",
            "scores": { "face_identity": 0.68 },
            "thresholds": { "face_identity": 0.75 },
        })))
        .await
        .unwrap();

    let tuning = wait_for_task(
        &orch,
        "P3",
        TaskKind::PromptTuning,
        Some(TaskStatus::Completed),
        Duration::from_secs(20),
    )
    .await;
    assert_eq!(tuning.input["shot_id"], "S02");

    // A second keyframe task exists with retry lineage 1 and, after a
    // passing QA round, the preview task follows.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let keyframes: Vec<Task> = orch
            .list_tasks("P3", None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TaskKind::GenerateKeyframe)
            .collect();
        if keyframes.iter().any(|t| t.retry_count == 1) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no retried keyframe task");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let has_preview = orch
            .list_tasks("P3", None, None)
            .await
            .unwrap()
            .iter()
            .any(|t| t.kind == TaskKind::GeneratePreviewVideo && t.input["shot_id"] == "S02");
        if has_preview {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no preview task for S02");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    orch.stop();
}

// Scenario 4: approval revise. The checkpoint pauses the project before
// shot planning; a revision request produces a rewrite task carrying the
// notes, and the next scene triggers a fresh gate.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn approval_revision_reissues_the_stage() {
    let tmp = tempfile::TempDir::new().unwrap();
    let orch = Orchestrator::open(test_config(tmp.path())).unwrap();
    register_stubs(&orch, Arc::new(Mutex::new(VecDeque::new())), 0.1, 0.1).await;
    orch.start().await.unwrap();

    orch.create_project(
        "P4",
        spec(6.0, false, vec![EventKind::SceneWritten]),
        Budget::new(Money::usd(20.0)),
    )
    .await
    .unwrap();

    wait_for_status(&orch, "P4", ProjectStatus::ApprovalPending, Duration::from_secs(20)).await;
    wait_for_event(&orch, "P4", EventKind::UserApprovalRequired, Duration::from_secs(5)).await;

    let pending = orch.list_pending_approvals("P4").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].stage, EventKind::SceneWritten);
    assert!(!pending[0].deferred_tasks.is_empty());
    // The downstream planner task was deferred, not enqueued.
    let tasks = orch.list_tasks("P4", None, None).await.unwrap();
    assert!(tasks.iter().all(|t| t.kind != TaskKind::PlanShots));

    orch.revise("P4", &pending[0].id, "make it funnier".into())
        .await
        .unwrap();

    let rewrite = wait_for_task(&orch, "P4", TaskKind::RewriteScript, None, Duration::from_secs(20)).await;
    assert_eq!(rewrite.input["revision_notes"], "make it funnier");
    assert!(rewrite.input.get("original").is_some());

    // The rewrite produces a new SceneWritten, which gates again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let pending = orch.list_pending_approvals("P4").await.unwrap();
        if pending.len() == 1 && pending[0].status == ApprovalStatus::Pending {
            let project = orch.state.get_project_uncached("P4").await.unwrap();
            if project.approval_history.len() == 1 {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "second gate never opened");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    wait_for_status(&orch, "P4", ProjectStatus::ApprovalPending, Duration::from_secs(10)).await;

    orch.stop();
}

// Scenario 5: concurrent updates to one shot via optimistic versioning.
// The losing writer rereads and reapplies; both changes survive.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_shot_updates_preserve_both_changes() {
    let tmp = tempfile::TempDir::new().unwrap();
    let orch = Orchestrator::open(test_config(tmp.path())).unwrap();

    orch.state
        .create_project("P5", spec(6.0, true, vec![]), Budget::new(Money::usd(20.0)), &WriteCtx::actor("api"))
        .await
        .unwrap();
    let ctx = WriteCtx::actor("test");
    let mut patches = HashMap::new();
    patches.insert("S03".to_string(), serde_json::to_value(Shot::new("S03", 2, 6.0)).unwrap());
    orch.locks
        .acquire(&montage_locks::keys::shots_scope("P5"), "test", Duration::from_secs(60))
        .unwrap();
    orch.state
        .batch_update_shots("P5", patches, &ctx, "test")
        .await
        .unwrap();

    let base = orch.state.get_project_uncached("P5").await.unwrap();

    // Writer A (feature extraction) wins the first round.
    let mut patch_a = HashMap::new();
    patch_a.insert("S03".to_string(), json!({ "render_meta": { "features": [0.1, 0.4] } }));
    orch.state
        .batch_update_shots("P5", patch_a, &WriteCtx::actor("dna_curator").expecting(base.version), "test")
        .await
        .unwrap();

    // Writer B (visual QA) read the same version and must conflict.
    let mut patch_b = HashMap::new();
    patch_b.insert(
        "S03".to_string(),
        json!({ "qa": { "status": "pass", "scores": {}, "thresholds": {} } }),
    );
    let err = orch
        .state
        .batch_update_shots("P5", patch_b.clone(), &WriteCtx::actor("qa_agent").expecting(base.version), "test")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::VersionConflict { .. }));

    // Reread at the new version and reapply.
    let fresh = orch.state.get_project_uncached("P5").await.unwrap();
    orch.state
        .batch_update_shots("P5", patch_b, &WriteCtx::actor("qa_agent").expecting(fresh.version), "test")
        .await
        .unwrap();

    let shot = orch.state.get_shot("P5", "S03").await.unwrap();
    assert!(shot.render_meta.is_some(), "writer A's change survived");
    assert!(shot.qa.is_some(), "writer B's change survived");
    let final_project = orch.state.get_project_uncached("P5").await.unwrap();
    assert_eq!(final_project.version, base.version + 2);
}

// Idempotence: delivering the same event twice leaves the aggregate where
// the first delivery put it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_delivery_is_a_no_op() {
    let tmp = tempfile::TempDir::new().unwrap();
    let orch = Orchestrator::open(test_config(tmp.path())).unwrap();
    orch.state
        .create_project("P7", spec(6.0, true, vec![]), Budget::new(Money::usd(20.0)), &WriteCtx::actor("api"))
        .await
        .unwrap();

    let event = Event::new("P7", EventKind::ProjectCreated, "api");
    orch.events.publish(event.clone()).await.unwrap();
    orch.handle_event(&event).await.unwrap();
    let after_first = orch.state.get_project_uncached("P7").await.unwrap();

    orch.handle_event(&event).await.unwrap();
    let after_second = orch.state.get_project_uncached("P7").await.unwrap();

    assert_eq!(after_first.version, after_second.version);
    assert_eq!(
        after_first.tasks.len(),
        after_second.tasks.len(),
        "duplicate delivery must not enqueue twice"
    );
}

// Aborting cancels queued work and stops the cascade.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn force_abort_cancels_pending_tasks() {
    let tmp = tempfile::TempDir::new().unwrap();
    let orch = Orchestrator::open(test_config(tmp.path())).unwrap();
    // No workers registered: tasks stay queued and in-aggregate.
    orch.start().await.unwrap();

    orch.create_project("P8", spec(6.0, true, vec![]), Budget::new(Money::usd(20.0)))
        .await
        .unwrap();
    wait_for_task(&orch, "P8", TaskKind::WriteScript, None, Duration::from_secs(10)).await;

    orch.abort("P8", "operator_request").await.unwrap();
    wait_for_status(&orch, "P8", ProjectStatus::Aborted, Duration::from_secs(10)).await;

    let project = orch.state.get_project_uncached("P8").await.unwrap();
    for task in project.tasks.values() {
        assert!(
            matches!(task.status, TaskStatus::Cancelled | TaskStatus::InProgress),
            "task {} left {:?}",
            task.id,
            task.status
        );
    }
    assert_eq!(orch.queue.depth("P8").await.unwrap(), 0);

    orch.stop();
}
