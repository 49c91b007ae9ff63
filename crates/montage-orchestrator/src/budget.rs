//! Budget enforcement: dispatch gating, threshold warnings, and the
//! force-abort ceiling.

use serde_json::json;
use std::sync::Arc;

use montage_events::EventStore;
use montage_observability::CoordEvent;
use montage_state::{StateStore, WriteCtx};
use montage_types::{Budget, CoreResult, Event, EventKind};

use crate::config::MontageConfig;
use crate::mapper::FallbackSpec;

/// Outcome of checking a task's estimated cost against the budget.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    Allow,
    /// Substitute the cheaper variant at the given estimated cost.
    Fallback { variant: String, estimated_cost: f64 },
    Deny,
}

#[derive(Clone)]
pub struct BudgetGate {
    config: Arc<MontageConfig>,
}

impl BudgetGate {
    pub fn new(config: Arc<MontageConfig>) -> Self {
        Self { config }
    }

    /// Dispatch check: the estimate must fit the remaining budget. When it
    /// does not and the task kind has a fallback variant, the reduced
    /// estimate is tried before denying.
    pub fn check(
        &self,
        budget: &Budget,
        estimated_cost: f64,
        fallback: Option<&FallbackSpec>,
    ) -> BudgetDecision {
        if estimated_cost <= 0.0 {
            return BudgetDecision::Allow; // free work is never gated
        }
        let allowance = budget.remaining() * self.config.budget_stop_ratio;
        if estimated_cost <= allowance {
            return BudgetDecision::Allow;
        }
        if let Some(fallback) = fallback {
            let reduced = estimated_cost * fallback.cost_multiplier;
            if reduced <= allowance {
                return BudgetDecision::Fallback {
                    variant: fallback.variant.clone(),
                    estimated_cost: reduced,
                };
            }
        }
        BudgetDecision::Deny
    }

    /// Record spend through the state store's atomic add and publish
    /// threshold crossings: a cost-overrun warning at the warn ratio, a
    /// budget-exhausted signal at the stop ratio, and a force-abort once
    /// spend passes the hard ceiling.
    pub async fn record_cost(
        &self,
        state: &StateStore,
        events: &EventStore,
        project_id: &str,
        amount: f64,
        category: &str,
        description: &str,
        ctx: &WriteCtx,
    ) -> CoreResult<f64> {
        let (_, spent) = state
            .add_cost(project_id, amount, category, description, ctx)
            .await?;
        let budget = state.get_budget(project_id).await?;
        let total = budget.total.amount;
        if total <= f64::EPSILON {
            return Ok(spent);
        }
        let prev_ratio = (spent - amount) / total;
        let ratio = spent / total;

        if crossed(prev_ratio, ratio, self.config.budget_warn_ratio) {
            CoordEvent::BudgetThreshold {
                project_id,
                spent,
                total,
            }
            .emit();
            self.publish_signal(
                events,
                project_id,
                EventKind::CostOverrunWarning,
                ctx,
                json!({ "spent": spent, "total": total, "ratio": ratio }),
            )
            .await?;
        }
        if crossed(prev_ratio, ratio, self.config.budget_stop_ratio) {
            self.publish_signal(
                events,
                project_id,
                EventKind::BudgetExhausted,
                ctx,
                json!({ "spent": spent, "total": total }),
            )
            .await?;
        }
        if ratio > self.config.force_abort_multiplier {
            self.publish_signal(
                events,
                project_id,
                EventKind::ForceAbort,
                ctx,
                json!({ "reason": "budget_ceiling", "spent": spent, "total": total }),
            )
            .await?;
        }
        Ok(spent)
    }

    async fn publish_signal(
        &self,
        events: &EventStore,
        project_id: &str,
        kind: EventKind,
        ctx: &WriteCtx,
        payload: serde_json::Value,
    ) -> CoreResult<()> {
        let mut event = Event::new(project_id, kind, "budget_gate")
            .with_payload(payload)
            .with_pointer("/budget");
        event.causation_id = ctx.causation_event_id.clone();
        events.publish(event).await?;
        Ok(())
    }
}

fn crossed(prev: f64, current: f64, threshold: f64) -> bool {
    prev < threshold && current >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use montage_types::Money;

    fn gate() -> BudgetGate {
        BudgetGate::new(Arc::new(MontageConfig::default()))
    }

    fn budget(total: f64, spent: f64) -> Budget {
        let mut budget = Budget::new(Money::usd(total));
        budget.spent = Money::usd(spent);
        budget
    }

    #[test]
    fn estimate_within_remaining_is_allowed() {
        assert_eq!(gate().check(&budget(10.0, 4.0), 5.0, None), BudgetDecision::Allow);
    }

    #[test]
    fn over_budget_without_fallback_is_denied() {
        assert_eq!(gate().check(&budget(10.0, 9.5), 1.0, None), BudgetDecision::Deny);
    }

    #[test]
    fn fallback_substitutes_when_reduced_estimate_fits() {
        let fallback = FallbackSpec {
            variant: "still_motion".into(),
            cost_multiplier: 0.3,
        };
        match gate().check(&budget(10.0, 9.5), 1.0, Some(&fallback)) {
            BudgetDecision::Fallback { variant, estimated_cost } => {
                assert_eq!(variant, "still_motion");
                assert!((estimated_cost - 0.3).abs() < 1e-9);
            }
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[test]
    fn fallback_that_still_overruns_is_denied() {
        let fallback = FallbackSpec {
            variant: "still_motion".into(),
            cost_multiplier: 0.9,
        };
        assert_eq!(
            gate().check(&budget(10.0, 9.95), 1.0, Some(&fallback)),
            BudgetDecision::Deny
        );
    }

    #[test]
    fn zero_cost_tasks_pass_even_when_overspent() {
        assert_eq!(gate().check(&budget(5.0, 6.0), 0.0, None), BudgetDecision::Allow);
    }

    #[test]
    fn threshold_crossing_detection() {
        assert!(crossed(0.79, 0.81, 0.8));
        assert!(!crossed(0.81, 0.9, 0.8));
        assert!(crossed(0.99, 1.0, 1.0));
    }
}
