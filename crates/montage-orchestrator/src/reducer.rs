//! Pure reduction of an event history into the derivable view of a
//! project.
//!
//! The event log is the source of truth for the aggregate's derivable
//! parts: folding a full replay must agree with the stored aggregate once
//! the pipeline is quiescent. Used by audits and tests to catch drift
//! between the two.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use montage_types::{Event, EventKind, ProjectStatus, ShotStatus};

#[derive(Debug, Clone, Default)]
pub struct ReplayView {
    pub status: Option<ProjectStatus>,
    pub shot_statuses: HashMap<String, ShotStatus>,
    pub completed_tasks: HashSet<String>,
    pub failed_tasks: HashSet<String>,
    /// Status to restore when an approval pause resolves.
    prior_status: Option<ProjectStatus>,
}

pub fn reduce(events: &[Event]) -> ReplayView {
    let mut view = ReplayView::default();
    for event in events {
        apply_event(&mut view, event);
    }
    view
}

pub fn apply_event(view: &mut ReplayView, event: &Event) {
    let shot_id = event
        .payload
        .get("shot_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    match event.kind {
        EventKind::ProjectCreated => view.status = Some(ProjectStatus::Created),
        EventKind::TaskAssigned => {
            if view.status == Some(ProjectStatus::Created) {
                view.status = Some(ProjectStatus::Planning);
            }
        }
        EventKind::ShotPlanned => {
            if matches!(
                view.status,
                Some(ProjectStatus::Created) | Some(ProjectStatus::Planning)
            ) {
                view.status = Some(ProjectStatus::Rendering);
            }
            if let Some(shots) = event.payload.get("shots").and_then(Value::as_array) {
                for shot in shots {
                    let id = shot
                        .as_str()
                        .map(str::to_string)
                        .or_else(|| shot.get("id").and_then(Value::as_str).map(str::to_string));
                    if let Some(id) = id {
                        view.shot_statuses.entry(id).or_insert(ShotStatus::Init);
                    }
                }
            }
        }
        EventKind::ImageGenerated => {
            if let Some(id) = shot_id {
                view.shot_statuses.insert(id, ShotStatus::KeyframeGenerated);
            }
        }
        EventKind::PreviewVideoReady => {
            if let Some(id) = shot_id {
                view.shot_statuses.insert(id, ShotStatus::PreviewReady);
            }
        }
        EventKind::ShotApproved => {
            if let Some(id) = shot_id {
                view.shot_statuses.insert(id, ShotStatus::Approved);
            }
        }
        EventKind::FinalVideoReady => {
            if let Some(id) = shot_id {
                view.shot_statuses.insert(id, ShotStatus::FinalRendered);
            }
        }
        EventKind::UserApprovalRequired | EventKind::HumanGateTriggered => {
            if view.status != Some(ProjectStatus::ApprovalPending) {
                view.prior_status = view.status;
            }
            view.status = Some(ProjectStatus::ApprovalPending);
        }
        EventKind::UserApproved | EventKind::UserRevisionRequested | EventKind::UserRejected => {
            if view.status == Some(ProjectStatus::ApprovalPending) {
                view.status = view.prior_status.take().or(Some(ProjectStatus::Planning));
            }
        }
        EventKind::AssemblyCompleted => view.status = Some(ProjectStatus::Delivered),
        EventKind::ProjectAborted => view.status = Some(ProjectStatus::Aborted),
        EventKind::TaskCompleted => {
            if let Some(task_id) = event.payload.get("task_id").and_then(Value::as_str) {
                view.completed_tasks.insert(task_id.to_string());
                view.failed_tasks.remove(task_id);
            }
        }
        EventKind::TaskFailed | EventKind::TaskTimedOut => {
            if let Some(task_id) = event.payload.get("task_id").and_then(Value::as_str) {
                if !view.completed_tasks.contains(task_id) {
                    view.failed_tasks.insert(task_id.to_string());
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, payload: Value) -> Event {
        Event::new("p1", kind, "test").with_payload(payload)
    }

    #[test]
    fn happy_path_folds_to_delivered() {
        let events = vec![
            event(EventKind::ProjectCreated, json!({})),
            event(EventKind::TaskAssigned, json!({"task_id": "t1"})),
            event(EventKind::SceneWritten, json!({})),
            event(EventKind::ShotPlanned, json!({"shots": [{"id": "S01"}]})),
            event(EventKind::ImageGenerated, json!({"shot_id": "S01"})),
            event(EventKind::PreviewVideoReady, json!({"shot_id": "S01"})),
            event(EventKind::ShotApproved, json!({"shot_id": "S01"})),
            event(EventKind::FinalVideoReady, json!({"shot_id": "S01"})),
            event(EventKind::AssemblyCompleted, json!({})),
        ];
        let view = reduce(&events);
        assert_eq!(view.status, Some(ProjectStatus::Delivered));
        assert_eq!(view.shot_statuses["S01"], ShotStatus::FinalRendered);
    }

    #[test]
    fn approval_pause_restores_prior_status() {
        let events = vec![
            event(EventKind::ProjectCreated, json!({})),
            event(EventKind::TaskAssigned, json!({"task_id": "t1"})),
            event(EventKind::UserApprovalRequired, json!({"approval_id": "a1"})),
        ];
        let mut view = reduce(&events);
        assert_eq!(view.status, Some(ProjectStatus::ApprovalPending));
        apply_event(
            &mut view,
            &event(EventKind::UserApproved, json!({"approval_id": "a1"})),
        );
        assert_eq!(view.status, Some(ProjectStatus::Planning));
    }

    #[test]
    fn abort_is_terminal_in_the_fold() {
        let events = vec![
            event(EventKind::ProjectCreated, json!({})),
            event(EventKind::ProjectAborted, json!({"reason": "admin"})),
        ];
        assert_eq!(reduce(&events).status, Some(ProjectStatus::Aborted));
    }

    #[test]
    fn completion_clears_earlier_failures() {
        let events = vec![
            event(EventKind::TaskFailed, json!({"task_id": "t1"})),
            event(EventKind::TaskCompleted, json!({"task_id": "t1"})),
        ];
        let view = reduce(&events);
        assert!(view.completed_tasks.contains("t1"));
        assert!(view.failed_tasks.is_empty());
    }
}
