pub mod approval;
pub mod budget;
pub mod config;
pub mod mapper;
pub mod orchestrator;
pub mod reducer;
pub mod scheduler;
pub mod worker;

pub use approval::ApprovalGate;
pub use budget::{BudgetDecision, BudgetGate};
pub use config::{config_for_dir, MontageConfig};
pub use mapper::{FallbackSpec, LockScope, MapRule, MapperTable, PayloadMatch, TaskTemplate};
pub use orchestrator::{qa_payload, Orchestrator};
pub use reducer::{apply_event, reduce, ReplayView};
pub use scheduler::Scheduler;
pub use worker::{WorkerAgent, WorkerContext, WorkerRegistry};
