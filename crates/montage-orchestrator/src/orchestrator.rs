//! The façade wiring every subsystem together.
//!
//! Subscribes to all event kinds as one consumer group, routes each event
//! through the mapping table and the budget/approval gates into the task
//! queue, performs task-lifecycle bookkeeping, and exposes the admin
//! operations. Duplicate deliveries are no-ops keyed by event id.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use montage_events::{EventStore, EventStoreConfig, EventSubscriber};
use montage_locks::LockService;
use montage_observability::CoordEvent;
use montage_queue::TaskQueue;
use montage_state::{StateStore, StateStoreConfig, WriteCtx};
use montage_types::{
    Budget, CoreError, CoreResult, ErrorEntry, ErrorSeverity, Event, EventKind, GlobalSpec,
    Project, ProjectStatus, QaStatus, ShotStatus, Task, TaskKind, TaskStatus,
};

use crate::approval::ApprovalGate;
use crate::budget::BudgetGate;
use crate::config::MontageConfig;
use crate::mapper::MapperTable;
use crate::scheduler::Scheduler;
use crate::worker::{WorkerAgent, WorkerRegistry};

const CONSUMER: &str = "orchestrator";
const ACTOR: &str = "orchestrator";

#[derive(Clone)]
pub struct Orchestrator {
    pub config: Arc<MontageConfig>,
    pub events: EventStore,
    pub state: StateStore,
    pub queue: TaskQueue,
    pub locks: LockService,
    mapper: Arc<RwLock<MapperTable>>,
    workers: WorkerRegistry,
    gate: ApprovalGate,
    budget: BudgetGate,
    scheduler: Scheduler,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Open every store under the configured state dir and assemble the
    /// façade. The mapping table is read from `mapper.json` when present so
    /// deployments can extend it without recompiling.
    pub fn open(config: MontageConfig) -> CoreResult<Self> {
        let locks = LockService::open(&config.locks_db())?;
        let events = EventStore::open(
            &config.events_db(),
            EventStoreConfig {
                redelivery_limit: config.redelivery_limit,
                max_chain_depth: config.max_chain_depth,
                ..EventStoreConfig::default()
            },
        )?;
        let state = StateStore::open(
            &config.state_db(),
            locks.clone(),
            StateStoreConfig {
                cache_ttl: Duration::from_secs(config.cache_ttl_secs),
                ..StateStoreConfig::default()
            },
        )?;
        let queue = TaskQueue::open(&config.queue_db())?;
        let mapper = match MapperTable::load(&config.mapper_table_path()) {
            Ok(table) => table,
            Err(_) => MapperTable::default(),
        };
        Ok(Self::assemble(config, events, state, queue, locks, mapper))
    }

    /// Assemble from already-open stores (tests, embedded deployments).
    pub fn assemble(
        config: MontageConfig,
        events: EventStore,
        state: StateStore,
        queue: TaskQueue,
        locks: LockService,
        mapper: MapperTable,
    ) -> Self {
        let config = Arc::new(config);
        let mapper = Arc::new(RwLock::new(mapper));
        let workers = WorkerRegistry::new();
        let budget = BudgetGate::new(config.clone());
        let gate = ApprovalGate::new(state.clone(), events.clone(), config.clone(), mapper.clone());
        let cancel = CancellationToken::new();
        let scheduler = Scheduler {
            state: state.clone(),
            queue: queue.clone(),
            locks: locks.clone(),
            events: events.clone(),
            workers: workers.clone(),
            mapper: mapper.clone(),
            budget: budget.clone(),
            config: config.clone(),
            instance_id: format!("scheduler-{}", uuid::Uuid::new_v4()),
            cancel: cancel.clone(),
        };
        Self {
            config,
            events,
            state,
            queue,
            locks,
            mapper,
            workers,
            gate,
            budget,
            scheduler,
            cancel,
        }
    }

    pub fn budget_gate(&self) -> BudgetGate {
        self.budget.clone()
    }

    pub async fn register_worker(&self, agent: Arc<dyn WorkerAgent>) {
        self.workers.register(agent).await;
    }

    /// Subscribe, start delivery pumps, and spawn the scheduler, watchdog,
    /// and approval-timeout loops.
    pub async fn start(&self) -> CoreResult<()> {
        self.events
            .subscribe(Arc::new(Router { orch: self.clone() }), EventKind::ALL.to_vec())
            .await?;
        self.events.start_consuming().await;
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await });
        let watchdog = self.scheduler.clone();
        tokio::spawn(async move { watchdog.run_watchdog().await });
        let this = self.clone();
        tokio::spawn(async move { this.approval_scan_loop().await });
        info!("orchestrator started");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.events.stop();
    }

    async fn approval_scan_loop(&self) {
        loop {
            match self.gate.scan_timeouts().await {
                Ok(released) => {
                    for task in released {
                        let project_id = task.project_id.clone();
                        if let Err(err) = self.enqueue_tasks(&project_id, vec![task]).await {
                            warn!(%err, "failed to enqueue auto-approved tasks");
                        }
                    }
                }
                Err(err) => warn!(%err, "approval scan failed"),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(self.config.approval_scan_ms)) => {}
            }
        }
    }

    // ---- event handling ---------------------------------------------------

    pub async fn handle_event(&self, event: &Event) -> CoreResult<()> {
        if self.events.was_handled(CONSUMER, &event.id).await? {
            return Ok(());
        }
        self.bookkeeping(event).await?;
        self.route(event).await?;
        self.events.mark_handled(CONSUMER, &event.id).await?;
        Ok(())
    }

    async fn bookkeeping(&self, event: &Event) -> CoreResult<()> {
        match event.kind {
            EventKind::ProjectCreated => self.ensure_project(event).await,
            EventKind::TaskCompleted => self.on_task_completed(event).await,
            EventKind::TaskFailed => self.on_task_faulted(event, "error").await,
            EventKind::TaskTimedOut => self.on_task_faulted(event, "timeout").await,
            EventKind::QaReport => self.on_qa_report(event).await,
            EventKind::ShotPlanned => self.on_shot_planned(event).await,
            EventKind::AssemblyCompleted => self.on_assembly_completed(event).await,
            EventKind::HumanGateTriggered => self.on_human_gate(event).await,
            EventKind::UserApproved
            | EventKind::UserRevisionRequested
            | EventKind::UserRejected => {
                let tasks = self.gate.decide(event).await?;
                if !tasks.is_empty() {
                    self.enqueue_tasks(&event.project_id, tasks).await?;
                }
                Ok(())
            }
            EventKind::ForceAbort => {
                self.abort_project(&event.project_id, "force_abort", Some(&event.id))
                    .await
            }
            _ => Ok(()),
        }
    }

    /// External callers may publish ProjectCreated before or instead of
    /// calling `create_project`; seed the aggregate from the payload when it
    /// is missing.
    async fn ensure_project(&self, event: &Event) -> CoreResult<()> {
        match self.state.get_project_uncached(&event.project_id).await {
            Ok(_) => Ok(()),
            Err(CoreError::NotFound(_)) => {
                let Some(spec) = event.payload.get("spec") else {
                    return Err(CoreError::Validation(
                        "project_created without aggregate or spec payload".to_string(),
                    ));
                };
                let spec: GlobalSpec = serde_json::from_value(spec.clone())?;
                let budget: Budget = match event.payload.get("budget") {
                    Some(raw) => serde_json::from_value(raw.clone())?,
                    None => Budget::new(montage_types::Money::usd(0.0)),
                };
                let ctx = WriteCtx::actor(&event.actor).caused_by(&event.id);
                self.state
                    .create_project(&event.project_id, spec, budget, &ctx)
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn on_task_completed(&self, event: &Event) -> CoreResult<()> {
        let Some(task_id) = event.payload.get("task_id").and_then(Value::as_str) else {
            return Ok(());
        };
        let project = match self.state.get_project_uncached(&event.project_id).await {
            Ok(p) => p,
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let Some(task) = project.tasks.get(task_id) else {
            return Ok(());
        };
        if task.status == TaskStatus::Completed {
            return Ok(()); // duplicate delivery
        }
        let mut task = task.clone();
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        let output = event.payload.get("output").cloned().unwrap_or(Value::Null);
        task.output = Some(if output.is_null() { json!({}) } else { output });
        if let Some(cost) = event.payload.get("actual_cost").and_then(Value::as_f64) {
            task.actual_cost = Some(cost);
        }
        let ctx = WriteCtx::actor(ACTOR).caused_by(&event.id);
        self.state.put_task(&event.project_id, task.clone(), &ctx).await?;
        self.queue.mark_completed(&task.id).await?;
        // The dispatch-time lock is held until this completion report.
        if let Some(key) = &task.required_lock_key {
            let _ = self.locks.release(key, &task.id)?;
        }
        CoordEvent::TaskSettled {
            project_id: &event.project_id,
            task_id: &task.id,
            outcome: "completed",
        }
        .emit();
        Ok(())
    }

    async fn on_task_faulted(&self, event: &Event, reason: &str) -> CoreResult<()> {
        let Some(task_id) = event.payload.get("task_id").and_then(Value::as_str) else {
            return Ok(());
        };
        let project = match self.state.get_project_uncached(&event.project_id).await {
            Ok(p) => p,
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let Some(task) = project.tasks.get(task_id) else {
            return Ok(());
        };
        if task.status != TaskStatus::InProgress {
            return Ok(()); // already handled (duplicate watchdog tick)
        }
        let mut task = task.clone();
        if let Some(key) = &task.required_lock_key {
            let _ = self.locks.release(key, &task.id)?;
        }
        task.retry_count += 1;
        task.failure_reason = Some(reason.to_string());
        let ctx = WriteCtx::actor(ACTOR).caused_by(&event.id);
        if task.can_retry() {
            info!(task_id = %task.id, retry = task.retry_count, reason, "re-enqueueing failed task");
            task.status = TaskStatus::Pending;
            task.started_at = None;
            self.state.put_task(&event.project_id, task.clone(), &ctx).await?;
            self.queue.requeue(&task.id).await?;
            CoordEvent::TaskSettled {
                project_id: &event.project_id,
                task_id: &task.id,
                outcome: "retrying",
            }
            .emit();
            return Ok(());
        }
        CoordEvent::TaskSettled {
            project_id: &event.project_id,
            task_id: &task.id,
            outcome: "failed",
        }
        .emit();
        task.status = TaskStatus::Failed;
        self.state.put_task(&event.project_id, task.clone(), &ctx).await?;
        self.queue.dequeue(&task.id).await?;
        self.state
            .append_error(
                &event.project_id,
                ErrorEntry::new(
                    ErrorSeverity::Error,
                    &task.assignee,
                    format!("task `{}` ({}) failed: {reason}, retries exhausted", task.id, task.kind),
                ),
                &ctx,
            )
            .await?;
        let error_id = self
            .events
            .publish(
                Event::new(&event.project_id, EventKind::ErrorOccurred, ACTOR)
                    .caused_by(&event.id)
                    .with_payload(json!({
                        "task_id": task.id,
                        "reason": reason,
                        "retries_exhausted": true,
                    })),
            )
            .await?;
        self.events
            .publish(
                Event::new(&event.project_id, EventKind::HumanGateTriggered, ACTOR)
                    .caused_by(&error_id)
                    .with_payload(json!({
                        "reason": "retries_exhausted",
                        "task_id": task.id,
                    })),
            )
            .await?;
        Ok(())
    }

    /// A passing video QA is the per-shot acceptance signal in auto flow:
    /// advance the shot and announce approval.
    async fn on_qa_report(&self, event: &Event) -> CoreResult<()> {
        let media = event.payload.get("media").and_then(Value::as_str);
        let status = event.payload.get("status").and_then(Value::as_str);
        let shot_id = event.payload.get("shot_id").and_then(Value::as_str);
        let (Some("video"), Some("pass"), Some(shot_id)) = (media, status, shot_id) else {
            return Ok(());
        };
        // The generating task may still hold the shot lock until its
        // completion event lands; wait briefly instead of bouncing the
        // message straight back to pending.
        let owner = format!("{ACTOR}:{}", event.id);
        let key = montage_locks::keys::shot(&event.project_id, shot_id);
        if !self
            .locks
            .acquire_blocking(&key, &owner, Duration::from_secs(30), Duration::from_secs(2))
            .await?
        {
            return Err(CoreError::LockUnavailable(key));
        }
        let update: CoreResult<bool> = async {
            let mut shot = self.state.get_shot(&event.project_id, shot_id).await?;
            if shot.status == ShotStatus::Approved || shot.status == ShotStatus::FinalRendered {
                return Ok(false);
            }
            shot.status = ShotStatus::Approved;
            if shot.qa.is_none() {
                shot.qa = serde_json::from_value(event.payload.clone()).ok();
            }
            let ctx = WriteCtx::actor(ACTOR).caused_by(&event.id);
            self.state
                .update_shot(&event.project_id, shot_id, shot, &ctx, &owner)
                .await?;
            Ok(true)
        }
        .await;
        let _ = self.locks.release(&key, &owner)?;
        if !update? {
            return Ok(());
        }
        self.events
            .publish(
                Event::new(&event.project_id, EventKind::ShotApproved, ACTOR)
                    .caused_by(&event.id)
                    .with_payload(json!({ "shot_id": shot_id }))
                    .with_pointer(format!("/shots/{shot_id}/status")),
            )
            .await?;
        Ok(())
    }

    async fn on_shot_planned(&self, event: &Event) -> CoreResult<()> {
        let project = match self.state.get_project_uncached(&event.project_id).await {
            Ok(p) => p,
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if matches!(project.status, ProjectStatus::Created | ProjectStatus::Planning) {
            let ctx = WriteCtx::actor(ACTOR).caused_by(&event.id);
            self.state
                .update_project_status(&event.project_id, ProjectStatus::Rendering, &ctx)
                .await?;
        }
        Ok(())
    }

    async fn on_assembly_completed(&self, event: &Event) -> CoreResult<()> {
        let project = match self.state.get_project_uncached(&event.project_id).await {
            Ok(p) => p,
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if project.status.is_terminal() {
            return Ok(());
        }
        let ctx = WriteCtx::actor(ACTOR).caused_by(&event.id);
        self.state
            .update_project_status(&event.project_id, ProjectStatus::Delivered, &ctx)
            .await?;
        self.events
            .publish(
                Event::new(&event.project_id, EventKind::ProjectFinalized, ACTOR)
                    .caused_by(&event.id)
                    .with_payload(json!({
                        "final_video": event.payload.get("final_video").cloned().unwrap_or(Value::Null),
                    }))
                    .with_pointer("/status"),
            )
            .await?;
        Ok(())
    }

    /// Pause for an administrative decision (budget exhausted, retries
    /// exhausted, quality critical, approval timeout).
    async fn on_human_gate(&self, event: &Event) -> CoreResult<()> {
        let project = match self.state.get_project_uncached(&event.project_id).await {
            Ok(p) => p,
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if project.status.is_terminal() {
            return Ok(());
        }
        self.gate.open(&project, event, Vec::new()).await?;
        Ok(())
    }

    /// Mapping plus gating: turn the event into tasks, wire dependencies,
    /// and either defer them behind an approval checkpoint or enqueue them.
    async fn route(&self, event: &Event) -> CoreResult<()> {
        let project = match self.state.get_project_uncached(&event.project_id).await {
            Ok(p) => p,
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if project.status.is_terminal() {
            return Ok(()); // in-flight results are recorded, nothing cascades
        }
        let mut tasks = {
            let mapper = self.mapper.read().await;
            mapper.map(event, &project)
        };
        if tasks.is_empty() {
            return Ok(());
        }
        self.wire_dependencies(&mut tasks, event, &project);

        if ApprovalGate::is_checkpoint(&project.spec.user_options, event.kind) {
            self.gate.open(&project, event, tasks).await?;
            return Ok(());
        }

        let depth = self.queue.depth(&event.project_id).await?;
        if depth >= self.config.queue_high_water {
            self.events
                .publish(
                    Event::new(&event.project_id, EventKind::QueuePressure, ACTOR)
                        .caused_by(&event.id)
                        .with_payload(json!({
                            "depth": depth,
                            "high_water": self.config.queue_high_water,
                        })),
                )
                .await?;
            // Leaving the message pending pauses task creation for this
            // project until depth recedes.
            return Err(CoreError::Transient(format!(
                "queue depth {depth} at high-water mark"
            )));
        }
        self.enqueue_tasks(&event.project_id, tasks).await
    }

    /// Dependencies are the orchestrator's concern, not the mapper's.
    fn wire_dependencies(&self, tasks: &mut [Task], event: &Event, project: &Project) {
        // Final assembly waits for music and voice, whether emitted in this
        // very mapping or already alive from an earlier event.
        let mut audio_ids: Vec<String> = tasks
            .iter()
            .filter(|t| matches!(t.kind, TaskKind::GenerateMusic | TaskKind::GenerateVoice))
            .map(|t| t.id.clone())
            .collect();
        audio_ids.extend(
            project
                .tasks
                .values()
                .filter(|t| {
                    matches!(t.kind, TaskKind::GenerateMusic | TaskKind::GenerateVoice)
                        && !matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled)
                })
                .map(|t| t.id.clone()),
        );
        for task in tasks.iter_mut() {
            if task.kind == TaskKind::AssembleFinal {
                task.depends_on = audio_ids.clone();
            }
        }

        // A keyframe re-generated after prompt tuning carries the retry
        // lineage of the keyframes before it.
        if event.kind == EventKind::TaskCompleted {
            for task in tasks.iter_mut() {
                if task.kind != TaskKind::GenerateKeyframe {
                    continue;
                }
                let shot_id = task.input.get("shot_id").and_then(Value::as_str);
                let prior = project
                    .tasks
                    .values()
                    .filter(|t| {
                        t.kind == TaskKind::GenerateKeyframe
                            && t.input.get("shot_id").and_then(Value::as_str) == shot_id
                    })
                    .map(|t| t.retry_count)
                    .max();
                if let Some(prior) = prior {
                    task.retry_count = prior + 1;
                }
            }
        }
    }

    async fn enqueue_tasks(&self, project_id: &str, tasks: Vec<Task>) -> CoreResult<()> {
        let mut editing = false;
        for mut task in tasks {
            let ctx = match &task.causation_event_id {
                Some(id) => WriteCtx::actor(ACTOR).caused_by(id.clone()),
                None => WriteCtx::actor(ACTOR),
            };
            if task.kind == TaskKind::HumanReviewRequired {
                // Human work is resolved by an admin decision, never
                // dispatched to an agent.
                task.status = TaskStatus::WaitingApproval;
                self.state.put_task(project_id, task, &ctx).await?;
                continue;
            }
            editing |= task.kind == TaskKind::AssembleFinal;
            self.state.put_task(project_id, task.clone(), &ctx).await?;
            self.queue.enqueue(&task).await?;
        }
        if editing {
            let project = self.state.get_project_uncached(project_id).await?;
            if matches!(project.status, ProjectStatus::Rendering | ProjectStatus::Qa) {
                self.state
                    .update_project_status(project_id, ProjectStatus::Editing, &WriteCtx::actor(ACTOR))
                    .await?;
            }
        }
        Ok(())
    }

    // ---- admin operations -------------------------------------------------

    /// Create the aggregate and publish the root event in one call.
    pub async fn create_project(
        &self,
        project_id: &str,
        spec: GlobalSpec,
        budget: Budget,
    ) -> CoreResult<String> {
        let ctx = WriteCtx::actor("api");
        let spec_value = serde_json::to_value(&spec)?;
        let budget_value = serde_json::to_value(&budget)?;
        self.state
            .create_project(project_id, spec, budget, &ctx)
            .await?;
        self.events
            .publish(
                Event::new(project_id, EventKind::ProjectCreated, "api")
                    .with_payload(json!({ "spec": spec_value, "budget": budget_value }))
                    .with_pointer("/"),
            )
            .await
    }

    pub async fn list_pending_approvals(
        &self,
        project_id: &str,
    ) -> CoreResult<Vec<montage_types::ApprovalRequest>> {
        self.state.list_pending_approvals(project_id).await
    }

    /// Inject a human decision; the decision flows through the event bus
    /// like any worker-published fact.
    pub async fn inject_decision(
        &self,
        project_id: &str,
        approval_id: &str,
        kind: EventKind,
        notes: Option<String>,
    ) -> CoreResult<String> {
        if !matches!(
            kind,
            EventKind::UserApproved | EventKind::UserRevisionRequested | EventKind::UserRejected
        ) {
            return Err(CoreError::Validation(format!(
                "`{kind}` is not a decision event"
            )));
        }
        let mut payload = json!({ "approval_id": approval_id });
        if let Some(notes) = notes {
            payload["notes"] = json!(notes);
        }
        self.events
            .publish(Event::new(project_id, kind, "admin").with_payload(payload))
            .await
    }

    pub async fn approve(&self, project_id: &str, approval_id: &str) -> CoreResult<String> {
        self.inject_decision(project_id, approval_id, EventKind::UserApproved, None)
            .await
    }

    pub async fn reject(
        &self,
        project_id: &str,
        approval_id: &str,
        notes: String,
    ) -> CoreResult<String> {
        self.inject_decision(project_id, approval_id, EventKind::UserRejected, Some(notes))
            .await
    }

    pub async fn revise(
        &self,
        project_id: &str,
        approval_id: &str,
        notes: String,
    ) -> CoreResult<String> {
        self.inject_decision(
            project_id,
            approval_id,
            EventKind::UserRevisionRequested,
            Some(notes),
        )
        .await
    }

    pub async fn list_tasks(
        &self,
        project_id: &str,
        status: Option<TaskStatus>,
        assignee: Option<&str>,
    ) -> CoreResult<Vec<Task>> {
        let project = self.state.get_project_uncached(project_id).await?;
        let mut tasks: Vec<Task> = project
            .tasks
            .into_values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| assignee.map_or(true, |a| t.assignee == a))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Put a failed task back in flight.
    pub async fn force_retry(&self, project_id: &str, task_id: &str) -> CoreResult<()> {
        let project = self.state.get_project_uncached(project_id).await?;
        let Some(task) = project.tasks.get(task_id) else {
            return Err(CoreError::NotFound(format!("task `{task_id}`")));
        };
        if task.status != TaskStatus::Failed {
            return Err(CoreError::Validation(format!(
                "task `{task_id}` is {:?}, not failed",
                task.status
            )));
        }
        let mut task = task.clone();
        task.status = TaskStatus::Pending;
        task.failure_reason = None;
        task.started_at = None;
        let ctx = WriteCtx::actor("admin");
        self.state.put_task(project_id, task.clone(), &ctx).await?;
        self.queue.enqueue(&task).await?;
        self.queue.requeue(&task.id).await?;
        Ok(())
    }

    pub async fn abort(&self, project_id: &str, reason: &str) -> CoreResult<String> {
        self.events
            .publish(
                Event::new(project_id, EventKind::ForceAbort, "admin")
                    .with_payload(json!({ "reason": reason })),
            )
            .await
    }

    async fn abort_project(
        &self,
        project_id: &str,
        reason: &str,
        causation: Option<&str>,
    ) -> CoreResult<()> {
        let project = match self.state.get_project_uncached(project_id).await {
            Ok(p) => p,
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if project.status.is_terminal() {
            return Ok(());
        }
        let ctx = match causation {
            Some(id) => WriteCtx::actor(ACTOR).caused_by(id),
            None => WriteCtx::actor(ACTOR),
        };
        self.state
            .update_project_status(project_id, ProjectStatus::Aborted, &ctx)
            .await?;
        self.queue.remove_project(project_id).await?;
        let mut cancelled = Vec::new();
        for task in project.tasks.values() {
            if matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::WaitingApproval
            ) {
                let mut task = task.clone();
                task.status = TaskStatus::Cancelled;
                cancelled.push(task.id.clone());
                self.state.put_task(project_id, task.clone(), &ctx).await?;
                let mut event = Event::new(project_id, EventKind::TaskCancelled, ACTOR)
                    .with_payload(json!({ "task_id": task.id }))
                    .with_pointer(format!("/tasks/{}", task.id));
                event.causation_id = causation.map(str::to_string);
                self.events.publish(event).await?;
            }
        }
        let mut aborted = Event::new(project_id, EventKind::ProjectAborted, ACTOR)
            .with_payload(json!({ "reason": reason, "cancelled_tasks": cancelled }))
            .with_pointer("/status");
        aborted.causation_id = causation.map(str::to_string);
        self.events.publish(aborted).await?;
        info!(project_id, reason, "project aborted");
        Ok(())
    }

    /// Swap in a new mapping table at runtime.
    pub async fn reload_mapper(&self, table: MapperTable) {
        *self.mapper.write().await = table;
    }

    pub async fn project_status(&self, project_id: &str) -> CoreResult<(u64, ProjectStatus)> {
        let project = self.state.get_project_uncached(project_id).await?;
        Ok((project.version, project.status))
    }
}

struct Router {
    orch: Orchestrator,
}

#[async_trait]
impl EventSubscriber for Router {
    fn name(&self) -> &str {
        CONSUMER
    }

    async fn handle_event(&self, event: &Event) -> CoreResult<()> {
        self.orch.handle_event(event).await
    }
}

/// Convenience for workers publishing QA results.
pub fn qa_payload(shot_id: &str, media: &str, status: QaStatus, scores: Value, thresholds: Value) -> Value {
    json!({
        "shot_id": shot_id,
        "media": media,
        "status": status,
        "scores": scores,
        "thresholds": thresholds,
    })
}
