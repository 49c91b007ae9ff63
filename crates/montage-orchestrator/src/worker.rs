//! The seam worker agents plug into.
//!
//! Agents receive dispatched tasks with a context handle for the shared
//! stores. They publish their domain events themselves (carrying the
//! assignment event id as causation) and return the task output; the
//! scheduler turns the return value into the task-completed or task-failed
//! event.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use montage_events::EventStore;
use montage_locks::LockService;
use montage_state::{StateStore, WriteCtx};
use montage_types::{CoreResult, Task};

use crate::budget::BudgetGate;
use crate::config::MontageConfig;

/// Everything an agent needs to read snapshots, propose updates, take
/// locks, and publish events while executing one task.
#[derive(Clone)]
pub struct WorkerContext {
    pub events: EventStore,
    pub state: StateStore,
    pub locks: LockService,
    pub config: Arc<MontageConfig>,
    pub budget: BudgetGate,
    /// Event id of the task-assigned event; agents chain their published
    /// events off it.
    pub assignment_event_id: String,
}

impl WorkerContext {
    /// Record spend for the current task. Goes through the budget gate so
    /// threshold warnings and the force-abort ceiling fire as spend
    /// accumulates.
    pub async fn record_cost(
        &self,
        project_id: &str,
        amount: f64,
        category: &str,
        description: &str,
    ) -> CoreResult<f64> {
        let ctx = WriteCtx::actor("worker").caused_by(&self.assignment_event_id);
        self.budget
            .record_cost(
                &self.state,
                &self.events,
                project_id,
                amount,
                category,
                description,
                &ctx,
            )
            .await
    }
}

#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Assignee name tasks are routed by.
    fn name(&self) -> &str;

    /// Execute one task. The returned value becomes the task output.
    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> CoreResult<Value>;
}

/// In-process agents by assignee name. Agents running out of process skip
/// this registry and consume task-assigned events off the bus instead.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<dyn WorkerAgent>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, agent: Arc<dyn WorkerAgent>) {
        self.agents
            .write()
            .await
            .insert(agent.name().to_string(), agent);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn WorkerAgent>> {
        self.agents.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
