//! Pulls ready tasks off the queue and dispatches them to agents.
//!
//! Every dispatch re-checks dependencies against a cache-bypassing state
//! read, asks the budget gate, honors the project pause, and takes the
//! task's named lock non-blocking. The lock is released only when the
//! completion (or failure) event arrives, never at dispatch time. Multiple
//! scheduler instances are safe: the queue's atomic claim admits one winner
//! per task.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use montage_events::EventStore;
use montage_locks::LockService;
use montage_observability::CoordEvent;
use montage_queue::{QueueEntry, TaskQueue};
use montage_state::{StateStore, WriteCtx};
use montage_types::{
    CoreResult, ErrorEntry, ErrorSeverity, Event, EventKind, Project, ProjectStatus, Task,
    TaskStatus,
};

use crate::budget::{BudgetDecision, BudgetGate};
use crate::config::MontageConfig;
use crate::mapper::MapperTable;
use crate::worker::{WorkerContext, WorkerRegistry};

const ACTOR: &str = "scheduler";

#[derive(Clone)]
pub struct Scheduler {
    pub(crate) state: StateStore,
    pub(crate) queue: TaskQueue,
    pub(crate) locks: LockService,
    pub(crate) events: EventStore,
    pub(crate) workers: WorkerRegistry,
    pub(crate) mapper: Arc<RwLock<MapperTable>>,
    pub(crate) budget: BudgetGate,
    pub(crate) config: Arc<MontageConfig>,
    pub(crate) instance_id: String,
    pub(crate) cancel: CancellationToken,
}

impl Scheduler {
    /// Main loop: drain ready work, then sleep a tick. The periodic re-scan
    /// matters even without events, because a dependency can be satisfied
    /// out of band (approval resume, admin retry).
    pub async fn run(&self) {
        loop {
            if let Err(err) = self.process_ready().await {
                error!(%err, "scheduler pass failed");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(self.config.scheduler_tick_ms)) => {}
            }
        }
    }

    /// Watchdog loop: fail expired in-progress tasks and periodically sweep
    /// retired projects' events past retention.
    pub async fn run_watchdog(&self) {
        let mut last_sweep = Instant::now();
        loop {
            if let Err(err) = self.scan_timeouts().await {
                error!(%err, "watchdog pass failed");
            }
            if last_sweep.elapsed() > Duration::from_secs(3600) {
                last_sweep = Instant::now();
                if let Err(err) = self.sweep_retention().await {
                    warn!(%err, "retention sweep failed");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(self.config.watchdog_tick_ms)) => {}
            }
        }
    }

    pub async fn process_ready(&self) -> CoreResult<()> {
        let batch = self.queue.ready_batch(16).await?;
        for entry in batch {
            if let Err(err) = self.try_dispatch(entry).await {
                warn!(%err, "dispatch attempt failed");
            }
        }
        Ok(())
    }

    async fn try_dispatch(&self, entry: QueueEntry) -> CoreResult<()> {
        // Cache-bypassing read: dispatch decisions must not act on stale
        // snapshots.
        let project = self.state.get_project_uncached(&entry.project_id).await?;
        if project.status == ProjectStatus::ApprovalPending {
            return Ok(()); // paused; leave the task queued
        }
        if project.status.is_terminal() {
            self.queue.dequeue(&entry.task_id).await?;
            return Ok(());
        }
        let Some(task) = project.tasks.get(&entry.task_id).cloned() else {
            warn!(task_id = %entry.task_id, "queued task has no body; dropping");
            self.queue.dequeue(&entry.task_id).await?;
            return Ok(());
        };
        match task.status {
            TaskStatus::Pending | TaskStatus::Ready => {}
            TaskStatus::Completed => {
                self.queue.mark_completed(&task.id).await?;
                return Ok(());
            }
            TaskStatus::Cancelled | TaskStatus::Failed => {
                self.queue.dequeue(&task.id).await?;
                return Ok(());
            }
            TaskStatus::InProgress | TaskStatus::WaitingApproval => return Ok(()),
        }
        // Strict gate: never in-progress before every dependency completed.
        for dep in &task.depends_on {
            match project.tasks.get(dep) {
                Some(dep_task) if dep_task.status == TaskStatus::Completed => {}
                _ => return Ok(()),
            }
        }

        let mut task = task;
        let fallback = {
            let mapper = self.mapper.read().await;
            mapper.fallback_for(task.kind).cloned()
        };
        match self.budget.check(&project.budget, task.estimated_cost, fallback.as_ref()) {
            BudgetDecision::Allow => {}
            BudgetDecision::Fallback { variant, estimated_cost } => {
                info!(task_id = %task.id, %variant, "substituting budget fallback variant");
                task.estimated_cost = estimated_cost;
                if let Value::Object(map) = &mut task.input {
                    map.insert("variant".to_string(), json!(variant));
                }
            }
            BudgetDecision::Deny => {
                return self.fail_for_budget(&project, task).await;
            }
        }

        // Atomic claim: exactly one scheduler instance proceeds.
        if !self.queue.claim(&task.id, &self.instance_id).await? {
            return Ok(());
        }
        if let Some(key) = task.required_lock_key.clone() {
            let ttl = self.config.task_timeout(task.kind) + Duration::from_secs(30);
            if !self.locks.acquire(&key, &task.id, ttl)? {
                debug!(task_id = %task.id, %key, "lock contested; task stays queued");
                self.queue.requeue(&task.id).await?;
                return Ok(());
            }
            let mirror_ctx = WriteCtx::actor(ACTOR);
            if let Err(err) = self.state.refresh_lock_mirror(&project.id, &mirror_ctx).await {
                debug!(%err, "lock mirror refresh skipped");
            }
        }

        let ctx = match &task.causation_event_id {
            Some(id) => WriteCtx::actor(ACTOR).caused_by(id.clone()),
            None => WriteCtx::actor(ACTOR),
        };
        if project.status == ProjectStatus::Created {
            self.state
                .update_project_status(&project.id, ProjectStatus::Planning, &ctx)
                .await?;
        }
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        self.state.put_task(&project.id, task.clone(), &ctx).await?;

        let mut assigned = Event::new(&project.id, EventKind::TaskAssigned, ACTOR)
            .with_payload(json!({
                "task_id": task.id,
                "kind": task.kind,
                "assignee": task.assignee,
                "priority": task.priority,
                "retry_count": task.retry_count,
                "input": task.input,
            }))
            .with_pointer(format!("/tasks/{}", task.id));
        assigned.causation_id = task.causation_event_id.clone();
        let assigned_id = self.events.publish(assigned).await?;
        CoordEvent::TaskDispatched {
            project_id: &project.id,
            task_id: &task.id,
            assignee: &task.assignee,
            assignment_event_id: &assigned_id,
        }
        .emit();

        if let Some(agent) = self.workers.get(&task.assignee).await {
            let worker_ctx = WorkerContext {
                events: self.events.clone(),
                state: self.state.clone(),
                locks: self.locks.clone(),
                config: self.config.clone(),
                budget: self.budget.clone(),
                assignment_event_id: assigned_id.clone(),
            };
            let events = self.events.clone();
            let task_for_agent = task.clone();
            tokio::spawn(async move {
                let result = agent.execute(&task_for_agent, &worker_ctx).await;
                let mut payload = match &result {
                    Ok(output) => json!({
                        "task_id": task_for_agent.id,
                        "kind": task_for_agent.kind,
                        "output": output,
                    }),
                    Err(err) => json!({
                        "task_id": task_for_agent.id,
                        "kind": task_for_agent.kind,
                        "error": err.to_string(),
                    }),
                };
                if let Some(shot_id) = task_for_agent.input.get("shot_id") {
                    payload["shot_id"] = shot_id.clone();
                }
                let kind = if result.is_ok() {
                    EventKind::TaskCompleted
                } else {
                    EventKind::TaskFailed
                };
                let report = Event::new(&task_for_agent.project_id, kind, agent.name())
                    .caused_by(&assigned_id)
                    .with_payload(payload)
                    .with_pointer(format!("/tasks/{}", task_for_agent.id));
                if let Err(publish_err) = events.publish(report).await {
                    error!(%publish_err, task_id = %task_for_agent.id, "failed to publish task outcome");
                }
            });
        }
        Ok(())
    }

    async fn fail_for_budget(&self, project: &Project, mut task: Task) -> CoreResult<()> {
        warn!(task_id = %task.id, project_id = %project.id, "task denied by budget gate");
        self.queue.dequeue(&task.id).await?;
        let ctx = match &task.causation_event_id {
            Some(id) => WriteCtx::actor(ACTOR).caused_by(id.clone()),
            None => WriteCtx::actor(ACTOR),
        };
        task.status = TaskStatus::Failed;
        task.failure_reason = Some("budget_exhausted".to_string());
        self.state.put_task(&project.id, task.clone(), &ctx).await?;
        self.state
            .append_error(
                &project.id,
                ErrorEntry::new(
                    ErrorSeverity::Error,
                    ACTOR,
                    format!(
                        "task `{}` ({}) denied: estimated {} exceeds remaining {}",
                        task.id,
                        task.kind,
                        task.estimated_cost,
                        project.budget.remaining()
                    ),
                ),
                &ctx,
            )
            .await?;
        let mut error_event = Event::new(&project.id, EventKind::ErrorOccurred, ACTOR)
            .with_payload(json!({
                "task_id": task.id,
                "reason": "budget_exhausted",
                "estimated_cost": task.estimated_cost,
                "remaining": project.budget.remaining(),
            }));
        error_event.causation_id = task.causation_event_id.clone();
        let error_id = self.events.publish(error_event).await?;
        self.events
            .publish(
                Event::new(&project.id, EventKind::HumanGateTriggered, ACTOR)
                    .caused_by(&error_id)
                    .with_payload(json!({
                        "reason": "budget_exhausted",
                        "task_id": task.id,
                    })),
            )
            .await?;
        Ok(())
    }

    /// Fail in-progress tasks that blew their deadline. The transition
    /// itself happens in the orchestrator's TaskTimedOut handler so it runs
    /// exactly once even with several watchdogs.
    pub async fn scan_timeouts(&self) -> CoreResult<()> {
        let now = Utc::now();
        for (project_id, _, status) in self.state.list_projects().await? {
            if status.is_terminal() {
                continue;
            }
            let project = self.state.get_project_uncached(&project_id).await?;
            for task in project.tasks.values() {
                if task.status != TaskStatus::InProgress {
                    continue;
                }
                let Some(started) = task.started_at else { continue };
                let deadline = started
                    + chrono::Duration::from_std(self.config.task_timeout(task.kind))
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                if now <= deadline {
                    continue;
                }
                let mut timed_out = Event::new(&project_id, EventKind::TaskTimedOut, ACTOR)
                    .with_payload(json!({
                        "task_id": task.id,
                        "kind": task.kind,
                        "started_at": started,
                    }))
                    .with_pointer(format!("/tasks/{}", task.id));
                timed_out.causation_id = task.causation_event_id.clone();
                self.events.publish(timed_out).await?;
            }
        }
        Ok(())
    }

    async fn sweep_retention(&self) -> CoreResult<()> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days as i64);
        for (project_id, _, status) in self.state.list_projects().await? {
            if status.is_terminal() {
                let removed = self.events.sweep_retention(&project_id, cutoff).await?;
                if removed > 0 {
                    info!(%project_id, removed, "retired project events swept");
                }
            }
        }
        Ok(())
    }
}
