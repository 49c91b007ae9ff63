//! Human-approval checkpoints.
//!
//! A gated event defers its mapped tasks inside an approval request and
//! parks the project in ApprovalPending. Decisions arrive as events; a
//! timeout scanner sends one reminder and, at twice the timeout, either
//! auto-approves or escalates to the human gate. Pauses survive restarts
//! because they are project state, not in-memory waits.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use montage_events::EventStore;
use montage_observability::CoordEvent;
use montage_state::{StateStore, WriteCtx};
use montage_types::{
    ApprovalRequest, ApprovalStatus, CoreError, CoreResult, Event, EventKind, Project,
    ProjectStatus, Task, UserOptions,
};

use crate::config::MontageConfig;
use crate::mapper::MapperTable;

const ACTOR: &str = "approval_gate";

#[derive(Clone)]
pub struct ApprovalGate {
    state: StateStore,
    events: EventStore,
    config: Arc<MontageConfig>,
    mapper: Arc<RwLock<MapperTable>>,
}

impl ApprovalGate {
    pub fn new(
        state: StateStore,
        events: EventStore,
        config: Arc<MontageConfig>,
        mapper: Arc<RwLock<MapperTable>>,
    ) -> Self {
        Self {
            state,
            events,
            config,
            mapper,
        }
    }

    /// Whether `kind` pauses this project for approval. Auto mode bypasses
    /// every checkpoint.
    pub fn is_checkpoint(options: &UserOptions, kind: EventKind) -> bool {
        !options.auto_mode && options.approval_checkpoints.contains(&kind)
    }

    /// Pause the project at a checkpoint: persist the request with its
    /// deferred tasks, move to ApprovalPending, announce to humans.
    pub async fn open(
        &self,
        project: &Project,
        event: &Event,
        deferred: Vec<Task>,
    ) -> CoreResult<String> {
        let mut request = ApprovalRequest::new(
            &project.id,
            event.kind,
            format!("approval required at {}", event.kind),
        );
        request.content = event.payload.clone();
        request.prior_status = Some(project.status);
        request.deferred_tasks = deferred;
        request.gating_event_id = Some(event.id.clone());
        let approval_id = request.id.clone();

        let ctx = WriteCtx::actor(ACTOR).caused_by(&event.id);
        self.state
            .create_approval(&project.id, request, &ctx)
            .await?;
        if project.status != ProjectStatus::ApprovalPending {
            self.state
                .update_project_status(&project.id, ProjectStatus::ApprovalPending, &ctx)
                .await?;
        }
        self.events
            .publish(
                Event::new(&project.id, EventKind::UserApprovalRequired, ACTOR)
                    .caused_by(&event.id)
                    .with_payload(json!({
                        "approval_id": approval_id,
                        "stage": event.kind,
                        "summary": format!("approval required at {}", event.kind),
                    }))
                    .with_pointer(format!("/approval_requests/{approval_id}")),
            )
            .await?;
        CoordEvent::ProjectPaused {
            project_id: &project.id,
            reason: event.kind.as_str(),
        }
        .emit();
        Ok(approval_id)
    }

    /// Ingest a decision event. Returns the follow-up tasks the orchestrator
    /// should enqueue: the deferred tasks on approval, a revision task on a
    /// revision request, a full-redo task on rejection.
    pub async fn decide(&self, event: &Event) -> CoreResult<Vec<Task>> {
        let status = match event.kind {
            EventKind::UserApproved => ApprovalStatus::Approved,
            EventKind::UserRevisionRequested => ApprovalStatus::RevisionRequested,
            EventKind::UserRejected => ApprovalStatus::Rejected,
            _ => return Ok(Vec::new()),
        };
        let Some(approval_id) = event.payload.get("approval_id").and_then(|v| v.as_str()) else {
            warn!(event_id = %event.id, "decision event without approval_id");
            return Ok(Vec::new());
        };
        let notes = event
            .payload
            .get("notes")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let ctx = WriteCtx::actor(ACTOR).caused_by(&event.id);
        let resolved = match self
            .state
            .resolve_approval(&event.project_id, approval_id, status, notes.clone(), &ctx)
            .await
        {
            Ok(resolved) => resolved,
            // A late decision for an already-resolved request is a no-op,
            // not a handler failure.
            Err(CoreError::NotFound(_)) | Err(CoreError::Validation(_)) => {
                warn!(approval_id, "decision for unresolved-able approval ignored");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        self.restore_status(&event.project_id, &resolved, &ctx).await?;

        match status {
            ApprovalStatus::Approved => {
                if resolved.stage == EventKind::HumanGateTriggered {
                    self.complete_human_reviews(&event.project_id, &ctx).await?;
                }
                Ok(resolved.deferred_tasks)
            }
            ApprovalStatus::RevisionRequested => {
                Ok(self.revision_task(&resolved, event, notes, false).await)
            }
            ApprovalStatus::Rejected => Ok(self.revision_task(&resolved, event, notes, true).await),
            _ => Ok(Vec::new()),
        }
    }

    async fn revision_task(
        &self,
        resolved: &ApprovalRequest,
        event: &Event,
        notes: Option<String>,
        full_redo: bool,
    ) -> Vec<Task> {
        let mapper = self.mapper.read().await;
        let kind = if full_redo {
            mapper.redo_task_for(resolved.stage)
        } else {
            mapper.revision_task_for(resolved.stage)
        };
        let Some(kind) = kind else {
            warn!(stage = %resolved.stage, "no revision mapping for stage");
            return Vec::new();
        };
        let mut input = json!({
            "original": resolved.content,
            "stage": resolved.stage,
            "full_redo": full_redo,
        });
        if let Some(notes) = notes {
            input["revision_notes"] = json!(notes);
        }
        if let Some(shot_id) = resolved.content.get("shot_id") {
            input["shot_id"] = shot_id.clone();
        }
        vec![mapper.instantiate(kind, &resolved.project_id, input, &event.id)]
    }

    async fn restore_status(
        &self,
        project_id: &str,
        resolved: &ApprovalRequest,
        ctx: &WriteCtx,
    ) -> CoreResult<()> {
        // Another approval may still be pending; only resume when this was
        // the last one.
        if !self.state.list_pending_approvals(project_id).await?.is_empty() {
            return Ok(());
        }
        let project = self.state.get_project_uncached(project_id).await?;
        if project.status != ProjectStatus::ApprovalPending {
            return Ok(());
        }
        let restored = match resolved.prior_status {
            Some(ProjectStatus::ApprovalPending) | None => ProjectStatus::Planning,
            Some(status) => status,
        };
        self.state
            .update_project_status(project_id, restored, ctx)
            .await?;
        Ok(())
    }

    async fn complete_human_reviews(&self, project_id: &str, ctx: &WriteCtx) -> CoreResult<()> {
        let project = self.state.get_project_uncached(project_id).await?;
        for task in project.tasks.values() {
            if task.kind == montage_types::TaskKind::HumanReviewRequired
                && task.status == montage_types::TaskStatus::WaitingApproval
            {
                let mut done = task.clone();
                done.status = montage_types::TaskStatus::Completed;
                done.output = Some(json!({ "decision": "approved" }));
                done.completed_at = Some(Utc::now());
                self.state.put_task(project_id, done, ctx).await?;
            }
        }
        Ok(())
    }

    /// Timeout scanner tick. Returns deferred tasks released by
    /// auto-approval so the orchestrator can enqueue them.
    pub async fn scan_timeouts(&self) -> CoreResult<Vec<Task>> {
        let timeout = self.config.approval_timeout();
        let now = Utc::now();
        let mut released = Vec::new();
        for (project_id, _, status) in self.state.list_projects().await? {
            if status.is_terminal() {
                continue;
            }
            for approval in self.state.list_pending_approvals(&project_id).await? {
                let age = now - approval.created_at;
                if age >= timeout * 2 {
                    let ctx = WriteCtx::actor(ACTOR);
                    let resolved = match self
                        .state
                        .resolve_approval(
                            &project_id,
                            &approval.id,
                            ApprovalStatus::Timeout,
                            Some("approval timed out".to_string()),
                            &ctx,
                        )
                        .await
                    {
                        Ok(resolved) => resolved,
                        Err(CoreError::NotFound(_)) | Err(CoreError::Validation(_)) => continue,
                        Err(err) => return Err(err),
                    };
                    self.events
                        .publish(
                            Event::new(&project_id, EventKind::ApprovalTimedOut, ACTOR)
                                .with_payload(json!({
                                    "approval_id": approval.id,
                                    "stage": approval.stage,
                                })),
                        )
                        .await?;
                    if self.config.auto_approve_on_timeout {
                        self.restore_status(&project_id, &resolved, &ctx).await?;
                        released.extend(resolved.deferred_tasks);
                    } else {
                        let mut gate = Event::new(
                            &project_id,
                            EventKind::HumanGateTriggered,
                            ACTOR,
                        )
                        .with_payload(json!({
                            "reason": "approval_timeout",
                            "approval_id": approval.id,
                        }));
                        gate.causation_id = approval.gating_event_id.clone();
                        self.events.publish(gate).await?;
                    }
                } else if age >= timeout && !approval.reminder_sent {
                    let mut reminded = approval.clone();
                    reminded.reminder_sent = true;
                    self.state
                        .create_approval(&project_id, reminded, &WriteCtx::actor(ACTOR))
                        .await?;
                    self.events
                        .publish(
                            Event::new(&project_id, EventKind::ApprovalReminder, ACTOR)
                                .with_payload(json!({
                                    "approval_id": approval.id,
                                    "stage": approval.stage,
                                    "age_minutes": age.num_minutes(),
                                })),
                        )
                        .await?;
                }
            }
        }
        Ok(released)
    }
}
